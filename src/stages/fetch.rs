//! Instruction fetch stage (spec.md §4.4), grounded verbatim in
//! `original_source/pyv/stages_entropy.py`'s `IFStage`.
//!
//! Owns the PC and instruction registers, splits the effective PC between
//! normal progression and the extractor's flush handshake, and gates the
//! instruction stream with NOPs while extraction is in progress.

use std::cell::RefCell;
use std::rc::Rc;

use crate::clocked::Reg;
use crate::extractor::{IfXt, XtIf};
use crate::isa::NOP_INST;
use crate::kernel::{callback, Callback, Kernel};
use crate::memory::ReadPort;
use crate::port::{Constant, Port, Wire};
use crate::stages::signals::IfId;

pub struct IfStage {
    epc_reg: Rc<Reg<i64>>,
    pc_reg: Rc<Reg<i64>>,
    ir_reg: Rc<Reg<u32>>,
    imem_read: ReadPort,

    /// Branch-unit-supplied next PC, used whenever extraction isn't
    /// holding or re-aligning the fetch stream.
    pub npc_i: Port<u32>,
    xtif_i: Wire<XtIf>,

    pub ifid_o: Port<IfId>,
    pub ifxt_o: Port<IfXt>,
    pub xt_o: Port<XtIf>,
}

impl IfStage {
    pub fn new(kernel: &Kernel, imem_read: ReadPort, xtif_i: Wire<XtIf>) -> Rc<RefCell<Self>> {
        let q = kernel.queue();

        // Instruction memory is always read-enabled at width 4; only the
        // address varies cycle to cycle. Tied off through `Constant`,
        // matching `original_source/pyv/stages_entropy.py`'s
        // `Constant(True)`/`Constant(4)` wiring of `IFStage`'s read port.
        imem_read.re.write(Constant::new(true).read());
        imem_read.width.write(Constant::new(4u32).read());

        let stage = Rc::new(RefCell::new(IfStage {
            epc_reg: Reg::new(kernel, -4i64),
            pc_reg: Reg::new(kernel, -4i64),
            ir_reg: Reg::new(kernel, NOP_INST),
            imem_read: imem_read.clone(),
            npc_i: Port::new(q.clone(), 0u32),
            xtif_i,
            ifid_o: Port::new(q.clone(), IfId::default()),
            ifxt_o: Port::new(q.clone(), IfXt::default()),
            xt_o: Port::new(q, XtIf::default()),
        }));

        // The instruction register's staged value always tracks whatever
        // the instruction memory's read port 1 currently reports, since
        // that address was itself driven from `epc_reg.next` this same
        // cycle (spec.md §4.4; matches `original_source/pyv`'s
        // `self.ir_reg.next << imem.rdata_o`).
        let ir_reg = Rc::clone(&stage.borrow().ir_reg);
        let rdata = imem_read.rdata.clone();
        let mem_cb: Callback = Rc::new(RefCell::new(move || {
            ir_reg.next().write(rdata.read());
        }));
        imem_read.rdata.subscribe(mem_cb);

        let cb = callback(&stage, IfStage::process);
        stage.borrow().npc_i.subscribe(Rc::clone(&cb));
        stage.borrow().xtif_i.subscribe(Rc::clone(&cb));
        // Prime the first propagation round: nothing has "changed" yet
        // out of reset, so without this the stage would never compute an
        // initial `epc.next`/output before the first tick (spec.md §4.2's
        // bind phase; matches `original_source/test/test_extractor.py`'s
        // explicit post-construction `_init()` call).
        kernel.schedule(cb);

        stage
    }

    fn process(&mut self) {
        let xt = self.xtif_i.read();
        let cur = self.epc_reg.cur().read();

        let new_epc = if xt.active {
            if xt.flush_bits {
                cur
            } else {
                cur + 4
            }
        } else if xt.ready {
            -8
        } else {
            self.npc_i.read() as i64
        };

        self.epc_reg.next().write(new_epc);
        self.pc_reg.next().write(new_epc);
        self.imem_read.addr.write(new_epc as u32);

        // While extraction is active/flushing/switching modes, downstream
        // sees NOPs. For the one or two cycles right after a mode switch
        // where `epc` is still re-aligning from its `-8` restart (i.e. has
        // not yet reached a real address), the instruction register may
        // still hold a stale or garbage fetch from the realignment itself;
        // substitute a NOP there too (spec.md §4.4; matches
        // `original_source/pyv/stages_entropy.py`'s `IFStage.process`
        // `elif self.epc_reg.cur.read() <= -4` branch).
        let gated_inst = if xt.active || xt.flush_bits || xt.ready {
            NOP_INST
        } else if cur <= -4 {
            NOP_INST
        } else {
            self.ir_reg.cur().read()
        };

        // `pc_reg.cur` is still negative (the `-4`/`-8` prestate) during the
        // very first cycle and every re-alignment after a mode switch; cast
        // straight to `u32` would wrap into a huge address and spuriously
        // trip decode's `PcOutOfBound` check even though `gated_inst` is
        // already forced to NOP for every such cycle. Clamp to 0 instead —
        // safe precisely because those are the same cycles gated above.
        let committed_pc = self.pc_reg.cur().read();
        let safe_pc = if committed_pc < 0 { 0 } else { committed_pc as u32 };
        self.ifid_o.write(IfId {
            inst: gated_inst,
            pc: safe_pc,
        });
        self.ifxt_o.write(IfXt {
            inst: self.ir_reg.cur().read(),
        });
        self.xt_o.write(xt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    #[test]
    fn resets_pc_to_zero_after_first_tick() {
        let kernel = Kernel::new();
        let mem = Memory::new(&kernel, 256);
        let xtif_i = {
            let p = Port::new(kernel.queue(), XtIf::default());
            p.wire()
        };
        let stage = IfStage::new(&kernel, mem.read_port1.clone(), xtif_i);
        kernel.step().unwrap();
        assert_eq!(stage.borrow().pc_reg.cur().read(), 0);
    }
}
