//! The entropy extractor (spec.md §4.5), grounded verbatim in
//! `original_source/pyv/extractor.py`'s `Extractor`.
//!
//! Siphons six bits out of every R-type (`OP`) instruction's `funct7`
//! while active, buffers up to 16 of them, and raises `flush_bits` for
//! [`crate::stages::mem::MemStage`] to pack and store once the buffer
//! fills (or a mode switch drains it early).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::clocked::Reg;
use crate::isa::{opcode, STOP_INST};
use crate::kernel::{callback, Kernel};
use crate::port::Port;
use crate::util::{get_bit, get_bits};

/// What [`crate::stages::fetch::IfStage`] passes to the extractor: the raw
/// fetched instruction, ungated by NOP injection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfXt {
    pub inst: u32,
}

/// What the extractor reports back to fetch (and, via fetch, to memory).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XtIf {
    pub entropy: Vec<u8>,
    pub active: bool,
    pub ready: bool,
    pub flush_bits: bool,
}

/// The flush-acknowledgment signal memory feeds back once a full flush has
/// committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TXt {
    pub flush_bits_ready: bool,
}

pub struct Extractor {
    eb_reg: Rc<Reg<Vec<u8>>>,
    ready: Cell<bool>,
    ready_out: Cell<bool>,
    active_out: Cell<bool>,
    flush_bits: Cell<bool>,
    pub ifxt_i: Port<IfXt>,
    pub txt_i: Port<TXt>,
    pub xtif_o: Port<XtIf>,
}

impl Extractor {
    /// Spec-default construction: `active_out` starts `true`, so the
    /// pipeline opens in the entropy extractor's scan phase (spec.md §4.5's
    /// literal initial state; matches `original_source/pyv/extractor.py`'s
    /// `self.active_out = True`). This is what `original_source/main.py`
    /// wires up for `core_type="single_entropy"`.
    pub fn new(kernel: &Kernel) -> Rc<RefCell<Self>> {
        Self::with_active(kernel, true)
    }

    /// Constructs with the extractor already dormant (`active_out` starts
    /// `false`), matching `original_source/main.py`'s plain
    /// `core_type="single"` configuration, which never wires an extractor
    /// into the pipeline at all. A dormant extractor never NOP-gates
    /// fetch and never appends entropy (its `OP`-instruction siphon is
    /// conditioned on `active_out`), so this is behaviorally equivalent to
    /// having no extractor present. See [`crate::cpu::CoreType::Single`].
    pub fn new_dormant(kernel: &Kernel) -> Rc<RefCell<Self>> {
        Self::with_active(kernel, false)
    }

    fn with_active(kernel: &Kernel, active_initial: bool) -> Rc<RefCell<Self>> {
        let q = kernel.queue();
        let initial_out = XtIf {
            entropy: Vec::new(),
            active: active_initial,
            ready: false,
            flush_bits: false,
        };
        let ext = Rc::new(RefCell::new(Extractor {
            eb_reg: Reg::new(kernel, Vec::new()),
            ready: Cell::new(false),
            ready_out: Cell::new(false),
            active_out: Cell::new(active_initial),
            flush_bits: Cell::new(false),
            ifxt_i: Port::new(q.clone(), IfXt::default()),
            txt_i: Port::new(q.clone(), TXt::default()),
            xtif_o: Port::new(q, initial_out),
        }));

        let cb = callback(&ext, Extractor::process);
        ext.borrow().ifxt_i.subscribe(Rc::clone(&cb));
        ext.borrow().txt_i.subscribe(cb);
        ext
    }

    fn process(&mut self) {
        let flush_ready = self.txt_i.read().flush_bits_ready;
        let inst = self.ifxt_i.read().inst;
        let mut entropy_list = self.eb_reg.cur().read();

        if inst == STOP_INST {
            tracing::info!("entropy extractor mode switch");
            self.ready.set(true);
        }

        self.ready_out
            .set(self.ready.get() && self.active_out.get());
        if self.ready.get() && self.active_out.get() {
            self.active_out.set(false);
        }

        let opcode = get_bits(inst, 6, 2);
        let funct7 = get_bits(inst, 31, 25);

        if flush_ready {
            entropy_list.clear();
        }

        if opcode == opcode::OP
            && self.active_out.get()
            && !self.flush_bits.get()
            && !flush_ready
        {
            let entropy = Self::entropy_bits(funct7);
            entropy_list.push(entropy);
            tracing::info!(entropy, "adding entropy value to register");
        }
        self.eb_reg.next().write(entropy_list.clone());

        let flush_bits = (self.flush_bits.get()
            || entropy_list.len() == 16
            || (self.ready.get() && !entropy_list.is_empty()))
            && !flush_ready;
        self.flush_bits.set(flush_bits);

        self.xtif_o.write(XtIf {
            entropy: entropy_list,
            active: self.active_out.get(),
            ready: self.ready_out.get(),
            flush_bits,
        });
    }

    /// `bits = (funct7[6] << 5) | funct7[4:0]`; bit 5 of funct7 is
    /// intentionally discarded (spec.md §4.5).
    fn entropy_bits(funct7: u32) -> u8 {
        let hi = get_bit(funct7, 6);
        let lo = get_bits(funct7, 4, 0);
        ((hi << 5) | lo) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_inst(funct7: u32) -> u32 {
        // R-type OP opcode (0b0110011) with arbitrary rd/rs1/rs2/funct3.
        (funct7 << 25) | 0b0110011
    }

    #[test]
    fn non_op_instructions_do_not_extract() {
        let kernel = Kernel::new();
        let ext = Extractor::new(&kernel);
        ext.borrow().ifxt_i.write(IfXt { inst: 0x0000_0013 }); // NOP (OP-IMM)
        kernel.step().unwrap();
        assert_eq!(ext.borrow().xtif_o.read().entropy.len(), 0);
    }

    #[test]
    fn sixteen_consecutive_op_instructions_fill_buffer_and_flush() {
        let kernel = Kernel::new();
        let ext = Extractor::new(&kernel);
        for i in 0..16u32 {
            ext.borrow().ifxt_i.write(IfXt { inst: op_inst(i) });
            kernel.step().unwrap();
        }
        let out = ext.borrow().xtif_o.read();
        assert_eq!(out.entropy.len(), 16);
        assert!(out.flush_bits);
    }

    #[test]
    fn dormant_extractor_never_gates_or_extracts() {
        let kernel = Kernel::new();
        let ext = Extractor::new_dormant(&kernel);
        for i in 0..20u32 {
            ext.borrow().ifxt_i.write(IfXt { inst: op_inst(i) });
            kernel.step().unwrap();
        }
        let out = ext.borrow().xtif_o.read();
        assert!(!out.active);
        assert!(!out.ready);
        assert_eq!(out.entropy.len(), 0);
    }

    #[test]
    fn entropy_bits_drop_bit5_of_funct7() {
        // funct7 = 0b1111101 -> bit6=1, bits4:0=11101 -> 0b111101 = 61
        assert_eq!(Extractor::entropy_bits(0b1111101), 61);
        // funct7 = 0b1111100 -> bit6=1, bits4:0=11100 -> 0b111100 = 60
        assert_eq!(Extractor::entropy_bits(0b1111100), 60);
    }
}
