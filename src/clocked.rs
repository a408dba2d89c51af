//! The pipeline register: the one clocked primitive in the design
//! (spec.md §4.1), grounded in `original_source/pyv/reg.py`'s `Reg` class
//! (`.cur`/`.next`, constructed with a reset value).
//!
//! Everything else in the simulator is either a [`crate::port::Port`]
//! (combinational) or built out of `Reg`.

use std::rc::Rc;

use crate::error::CoreResult;
use crate::kernel::{Clocked, Kernel};
use crate::port::Port;

/// A pipeline register exposing two ports: `cur` (this cycle's settled
/// value, read by downstream combinational logic) and `next` (the value
/// staged by upstream logic, adopted into `cur` on [`Clocked::tick`]).
///
/// Some consumers legitimately read `next` directly within the same cycle
/// — `original_source/pyv/stages_entropy.py`'s `IFStage` wires its next-PC
/// combinational input `self.npc_w` from `self.epc_reg.next`, not `.cur` —
/// so both ports are exposed rather than just `cur`.
pub struct Reg<T: Clone + PartialEq + 'static> {
    reset_value: T,
    cur: Port<T>,
    next: Port<T>,
}

impl<T: Clone + PartialEq + 'static> Reg<T> {
    /// Builds a register and registers it with `kernel` so it ticks (and
    /// resets) along with every other clocked element.
    pub fn new(kernel: &Kernel, reset_value: T) -> Rc<Self> {
        let reg = Rc::new(Reg {
            reset_value: reset_value.clone(),
            cur: Port::new(kernel.queue(), reset_value.clone()),
            next: Port::new(kernel.queue(), reset_value),
        });
        kernel.register_clocked(Rc::clone(&reg) as Rc<dyn Clocked>);
        reg
    }

    /// The settled, this-cycle value.
    pub fn cur(&self) -> &Port<T> {
        &self.cur
    }

    /// The staged, next-cycle value. Writable by upstream combinational
    /// logic during propagation; committed into `cur` on tick.
    pub fn next(&self) -> &Port<T> {
        &self.next
    }
}

impl<T: Clone + PartialEq + 'static> Clocked for Reg<T> {
    fn tick(&self) -> CoreResult<()> {
        self.cur.write(self.next.read());
        Ok(())
    }

    fn reset(&self) {
        self.cur.write(self.reset_value.clone());
        self.next.write(self.reset_value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_commits_staged_value() {
        let kernel = Kernel::new();
        let reg = Reg::new(&kernel, 0u32);
        reg.next().write(42);
        assert_eq!(reg.cur().read(), 0);
        reg.tick().unwrap();
        assert_eq!(reg.cur().read(), 42);
    }

    #[test]
    fn reset_restores_reset_value_on_both_ports() {
        let kernel = Kernel::new();
        let reg = Reg::new(&kernel, 7u32);
        reg.next().write(99);
        reg.tick().unwrap();
        assert_eq!(reg.cur().read(), 99);
        reg.reset();
        assert_eq!(reg.cur().read(), 7);
        assert_eq!(reg.next().read(), 7);
    }
}
