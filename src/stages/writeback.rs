//! Write-back stage and branch unit (spec.md §4.9), grounded verbatim in
//! `original_source/pyv/stages_entropy.py`'s `WBStage`/`BranchUnit`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::kernel::{callback, Kernel};
use crate::port::Port;
use crate::regfile::{CsrBank, Regfile};
use crate::stages::signals::MemWb;

pub struct WbStage {
    regfile: Rc<Regfile>,
    csr: Rc<CsrBank>,
    pub memwb_i: Port<MemWb>,
}

impl WbStage {
    pub fn new(kernel: &Kernel, regfile: Rc<Regfile>, csr: Rc<CsrBank>) -> Rc<RefCell<Self>> {
        let q = kernel.queue();
        let stage = Rc::new(RefCell::new(WbStage {
            regfile,
            csr,
            memwb_i: Port::new(q, MemWb::default()),
        }));

        let cb = callback(&stage, WbStage::process);
        stage.borrow().memwb_i.subscribe(Rc::clone(&cb));
        kernel.schedule(cb);

        stage
    }

    fn process(&mut self) {
        let val = self.memwb_i.read();

        if val.we {
            let wb_val = match val.wb_sel {
                0 => val.alu_res,      // ALU op
                1 => val.pc4,          // JAL
                2 => val.mem_rdata,    // LOAD
                3 => val.csr_read_val, // CSR
                _ => 0,
            };
            self.regfile.write_request(val.rd, wb_val);
        }

        if val.csr_write_en {
            self.csr.write_request(val.csr_addr, val.csr_write_val);
        }
    }
}

pub struct BranchUnit {
    pub pc_i: Port<u32>,
    pub take_branch_i: Port<bool>,
    pub target_i: Port<u32>,
    pub npc_o: Port<u32>,
}

impl BranchUnit {
    pub fn new(kernel: &Kernel) -> Rc<RefCell<Self>> {
        let q = kernel.queue();
        let unit = Rc::new(RefCell::new(BranchUnit {
            pc_i: Port::new(q.clone(), 0u32),
            take_branch_i: Port::new(q.clone(), false),
            target_i: Port::new(q.clone(), 0u32),
            npc_o: Port::new(q, 0u32),
        }));

        let cb = callback(&unit, BranchUnit::process);
        unit.borrow().pc_i.subscribe(Rc::clone(&cb));
        unit.borrow().take_branch_i.subscribe(Rc::clone(&cb));
        unit.borrow().target_i.subscribe(Rc::clone(&cb));
        kernel.schedule(cb);

        unit
    }

    fn process(&mut self) {
        let pc = self.pc_i.read();
        let npc = if self.take_branch_i.read() {
            self.target_i.read()
        } else {
            pc.wrapping_add(4)
        };
        self.npc_o.write(npc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    #[test]
    fn wb_sel_picks_load_result_and_requests_write() {
        let kernel = Kernel::new();
        let regfile = Regfile::new(&kernel);
        let csr = CsrBank::new(&kernel);
        let stage = WbStage::new(&kernel, Rc::clone(&regfile), csr);
        stage.borrow().memwb_i.write(MemWb {
            rd: 3,
            we: true,
            wb_sel: 2,
            mem_rdata: 0xABCD,
            ..MemWb::default()
        });
        kernel.step().unwrap();
        assert_eq!(regfile.read(3), 0xABCD);
    }

    #[test]
    fn no_write_when_we_is_false() {
        let kernel = Kernel::new();
        let regfile = Regfile::new(&kernel);
        let csr = CsrBank::new(&kernel);
        let stage = WbStage::new(&kernel, Rc::clone(&regfile), csr);
        stage.borrow().memwb_i.write(MemWb {
            rd: 3,
            we: false,
            alu_res: 0xFF,
            ..MemWb::default()
        });
        kernel.step().unwrap();
        assert_eq!(regfile.read(3), 0);
    }

    #[test]
    fn branch_unit_selects_target_when_taken() {
        let kernel = Kernel::new();
        let unit = BranchUnit::new(&kernel);
        unit.borrow().pc_i.write(100);
        unit.borrow().take_branch_i.write(true);
        unit.borrow().target_i.write(64);
        kernel.step().unwrap();
        assert_eq!(unit.borrow().npc_o.read(), 64);
    }

    #[test]
    fn branch_unit_falls_through_when_not_taken() {
        let kernel = Kernel::new();
        let unit = BranchUnit::new(&kernel);
        unit.borrow().pc_i.write(100);
        unit.borrow().take_branch_i.write(false);
        kernel.step().unwrap();
        assert_eq!(unit.borrow().npc_o.read(), 104);
    }
}
