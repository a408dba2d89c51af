//! Execute stage (spec.md §4.7), grounded in
//! `original_source/pyv/stages_entropy.py`'s `EXStage`.
//!
//! Runs the ALU, resolves branch/jump targets and conditions, and computes
//! the CSR read-modify-write value. The taken-branch misalignment check
//! runs as a stable hook so it only ever sees a settled target.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{CoreError, CoreResult};
use crate::isa::{csr_f3, opcode};
use crate::kernel::{callback, stable_hook, Kernel};
use crate::port::Port;
use crate::stages::signals::{ExMem, IdEx};

#[derive(Clone, Copy)]
struct BranchCheck {
    take_branch: bool,
    target: u32,
}

pub struct ExStage {
    pub idex_i: Port<IdEx>,
    pub exmem_o: Port<ExMem>,
    branch_check: Cell<BranchCheck>,
}

impl ExStage {
    pub fn new(kernel: &Kernel) -> Rc<RefCell<Self>> {
        let q = kernel.queue();
        let stage = Rc::new(RefCell::new(ExStage {
            idex_i: Port::new(q.clone(), IdEx::default()),
            exmem_o: Port::new(q, ExMem::default()),
            branch_check: Cell::new(BranchCheck {
                take_branch: false,
                target: 0,
            }),
        }));

        let cb = callback(&stage, ExStage::process);
        stage.borrow().idex_i.subscribe(Rc::clone(&cb));
        kernel.schedule(cb);

        let hook = stable_hook(&stage, ExStage::check_exception);
        kernel.register_stable_hook(hook);

        stage
    }

    fn process(&mut self) {
        let id = self.idex_i.read();
        let rs1 = id.rs1;
        let rs2 = id.rs2;
        let imm = id.imm;
        let pc = id.pc;

        let alu_res = match id.opcode {
            o if o == opcode::OP || o == opcode::OP_IMM => {
                alu_compute(id.opcode, id.funct3, id.funct7, rs1, if o == opcode::OP { rs2 } else { imm })
            }
            o if o == opcode::LUI => imm,
            o if o == opcode::AUIPC => pc.wrapping_add(imm),
            o if o == opcode::LOAD || o == opcode::STORE => rs1.wrapping_add(imm),
            o if o == opcode::JAL => pc.wrapping_add(imm),
            o if o == opcode::JALR => rs1.wrapping_add(imm) & !1u32,
            o if o == opcode::BRANCH => pc.wrapping_add(imm),
            _ => 0,
        };

        let take_branch = match id.opcode {
            o if o == opcode::BRANCH => branch_taken(id.funct3, rs1, rs2),
            o if o == opcode::JAL || o == opcode::JALR => true,
            _ => false,
        };

        self.branch_check.set(BranchCheck {
            take_branch,
            target: alu_res,
        });

        let csr_write_val = match id.funct3 {
            csr_f3::CSRRW | csr_f3::CSRRWI => rs1,
            csr_f3::CSRRS | csr_f3::CSRRSI => id.csr_read_val | rs1,
            csr_f3::CSRRC | csr_f3::CSRRCI => id.csr_read_val & !rs1,
            _ => id.csr_read_val,
        };

        self.exmem_o.write(ExMem {
            rd: id.rd,
            we: id.we,
            wb_sel: id.wb_sel,
            take_branch,
            alu_res,
            pc4: pc.wrapping_add(4),
            rs2,
            mem: id.mem,
            funct3: id.funct3,
            csr_addr: id.csr_addr,
            csr_read_val: id.csr_read_val,
            csr_write_en: id.csr_write_en,
            csr_write_val,
        });
    }

    fn check_exception(&mut self) -> CoreResult<()> {
        let check = self.branch_check.get();
        if check.take_branch && check.target & 0x3 != 0 {
            return Err(CoreError::InstructionAddressMisaligned { pc: check.target });
        }
        Ok(())
    }
}

/// ALU for the `OP`/`OP-IMM` opcodes only — every other opcode computes its
/// result with a plain adder above, since `funct3` means something else for
/// them (width selector, comparator, ...).
fn alu_compute(opcode: u32, funct3: u32, funct7: u32, a: u32, b: u32) -> u32 {
    match funct3 {
        0b000 => {
            if opcode == self::opcode::OP && funct7 == 0b0100000 {
                a.wrapping_sub(b)
            } else {
                a.wrapping_add(b)
            }
        }
        0b001 => a.wrapping_shl(b & 0x1F),
        0b010 => (((a as i32) < (b as i32)) as u32),
        0b011 => ((a < b) as u32),
        0b100 => a ^ b,
        0b101 => {
            if funct7 == 0b0100000 {
                ((a as i32).wrapping_shr(b & 0x1F)) as u32
            } else {
                a.wrapping_shr(b & 0x1F)
            }
        }
        0b110 => a | b,
        0b111 => a & b,
        _ => 0,
    }
}

fn branch_taken(funct3: u32, rs1: u32, rs2: u32) -> bool {
    match funct3 {
        0b000 => rs1 == rs2,                     // BEQ
        0b001 => rs1 != rs2,                     // BNE
        0b100 => (rs1 as i32) < (rs2 as i32),    // BLT
        0b101 => (rs1 as i32) >= (rs2 as i32),   // BGE
        0b110 => rs1 < rs2,                      // BLTU
        0b111 => rs1 >= rs2,                     // BGEU
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_computes_sum() {
        assert_eq!(alu_compute(opcode::OP, 0b000, 0, 2, 3), 5);
    }

    #[test]
    fn sub_requires_op_opcode_not_op_imm() {
        // funct3=0, funct7 bits happen to look like 0x20, but this is
        // OP-IMM (ADDI), so it must still add.
        assert_eq!(alu_compute(opcode::OP_IMM, 0b000, 0b0100000, 10, 3), 13);
        assert_eq!(alu_compute(opcode::OP, 0b000, 0b0100000, 10, 3), 7);
    }

    #[test]
    fn slt_is_signed_sltu_is_unsigned() {
        let neg_one = u32::MAX;
        assert_eq!(alu_compute(opcode::OP, 0b010, 0, neg_one, 1), 1); // -1 < 1 signed
        assert_eq!(alu_compute(opcode::OP, 0b011, 0, neg_one, 1), 0); // huge < 1 unsigned: false
    }

    #[test]
    fn sra_replicates_sign_bit() {
        let v = 0x8000_0000u32;
        assert_eq!(alu_compute(opcode::OP, 0b101, 0b0100000, v, 4), 0xF800_0000);
        assert_eq!(alu_compute(opcode::OP, 0b101, 0, v, 4), 0x0800_0000);
    }

    #[test]
    fn branch_comparators() {
        assert!(branch_taken(0b000, 5, 5));
        assert!(!branch_taken(0b000, 5, 6));
        assert!(branch_taken(0b110, 0, 1)); // BLTU
        assert!(!branch_taken(0b100, 0, u32::MAX)); // BLT signed: 0 < -1 is false
    }

    #[test]
    fn exec_rejects_misaligned_branch_target() {
        let kernel = Kernel::new();
        let stage = ExStage::new(&kernel);
        stage.borrow().idex_i.write(IdEx {
            rs1: 0,
            rs2: 0,
            imm: 2, // pc(0) + 2 is not 4-byte aligned
            pc: 0,
            opcode: opcode::BRANCH,
            funct3: 0b000,
            ..IdEx::default()
        });
        assert!(matches!(
            kernel.step(),
            Err(CoreError::InstructionAddressMisaligned { .. })
        ));
    }

    #[test]
    fn csr_rmw_set_bits() {
        let kernel = Kernel::new();
        let stage = ExStage::new(&kernel);
        stage.borrow().idex_i.write(IdEx {
            rs1: 0b0010,
            csr_read_val: 0b0001,
            funct3: csr_f3::CSRRS,
            opcode: opcode::SYSTEM,
            csr_write_en: true,
            ..IdEx::default()
        });
        kernel.step().unwrap();
        assert_eq!(stage.borrow().exmem_o.read().csr_write_val, 0b0011);
    }
}
