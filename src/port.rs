//! Single-writer signal ports (spec.md §4.1), grounded in
//! `original_source/pyv/port.py`'s `Input`/`Output`/`Wire`/`Constant` classes
//! as used throughout `mem.py`, `extractor.py` and `stages_entropy.py`.
//!
//! A [`Port`] holds one value and a sensitivity list of subscriber
//! callbacks. Writing a *different* value enqueues every subscriber onto
//! the kernel's propagation queue; writing the same value is a no-op, which
//! is what lets propagation reach a fixed point instead of re-running
//! unaffected logic forever.

use std::cell::RefCell;
use std::rc::Rc;

use crate::kernel::{Callback, CallbackQueue};

struct PortState<T> {
    value: T,
    subscribers: Vec<Callback>,
}

/// A writable signal: the output of exactly one module.
pub struct Port<T> {
    state: Rc<RefCell<PortState<T>>>,
    queue: CallbackQueue,
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Port {
            state: Rc::clone(&self.state),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Clone + PartialEq> Port<T> {
    pub fn new(queue: CallbackQueue, initial: T) -> Self {
        Port {
            state: Rc::new(RefCell::new(PortState {
                value: initial,
                subscribers: Vec::new(),
            })),
            queue,
        }
    }

    pub fn read(&self) -> T {
        self.state.borrow().value.clone()
    }

    /// Writes a new value. Subscribers are notified only if the value
    /// actually changed, so an idempotent re-write during a later
    /// propagation round doesn't re-enqueue its listeners.
    pub fn write(&self, value: T) {
        let mut state = self.state.borrow_mut();
        if state.value == value {
            return;
        }
        state.value = value;
        for cb in state.subscribers.iter() {
            self.queue.enqueue(Rc::clone(cb));
        }
    }

    /// Registers a callback to run whenever this port's value changes.
    pub fn subscribe(&self, cb: Callback) {
        self.state.borrow_mut().subscribers.push(cb);
    }

    /// Produces a read-only alias that shares this port's subscriber list:
    /// subscribing to the wire is exactly subscribing to the underlying
    /// port, and both observe the same value.
    pub fn wire(&self) -> Wire<T> {
        Wire {
            state: Rc::clone(&self.state),
        }
    }
}

/// A read-only alias for a [`Port`]'s current value and sensitivity list.
/// Used to fan a single output out to several downstream modules without
/// giving any of them write access.
pub struct Wire<T> {
    state: Rc<RefCell<PortState<T>>>,
}

impl<T> Clone for Wire<T> {
    fn clone(&self) -> Self {
        Wire {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone> Wire<T> {
    pub fn read(&self) -> T {
        self.state.borrow().value.clone()
    }

    pub fn subscribe(&self, cb: Callback) {
        self.state.borrow_mut().subscribers.push(cb);
    }
}

/// A write-once port: fixed for the lifetime of the simulation (tie-offs,
/// the reset vector, configuration words). Cheap to read, never schedules
/// anything.
pub struct Constant<T> {
    value: T,
}

impl<T: Clone> Constant<T> {
    pub fn new(value: T) -> Self {
        Constant { value }
    }

    pub fn read(&self) -> T {
        self.value.clone()
    }
}
