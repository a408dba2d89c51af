//! The simulator kernel: propagation-to-fixpoint, stable hooks, tick
//! ordering and the cycle counter (spec.md §4.2).
//!
//! A single [`Kernel`] is constructed per simulation run and threaded
//! explicitly through module construction rather than reached through a
//! global singleton — see DESIGN.md's note on "Global simulator state".

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{CoreError, CoreResult};
use crate::fault::FaultSpec;

/// A single queued unit of work: re-evaluate one module's combinational
/// logic, or commit one clocked element.
pub type Callback = Rc<RefCell<dyn FnMut()>>;

/// A stable hook runs once per cycle, after propagation has reached a fixed
/// point and before `tick`. This is where legality checks raise exceptions
/// (spec.md §4.2, §7), so they only ever observe settled values.
pub type StableHook = Rc<RefCell<dyn FnMut() -> CoreResult<()>>>;

/// Anything that adopts a staged "next" value into "current" on `tick`, and
/// can be returned to its power-on defaults on `reset`.
///
/// `tick` is fallible: the memory module raises [`CoreError::SegmentationFault`]
/// / [`CoreError::InvalidWidth`] synchronously at tick time rather than
/// during the stable-hook phase (spec.md §4.3, §7), since those checks
/// depend on the write actually committing.
pub trait Clocked {
    fn tick(&self) -> CoreResult<()>;
    fn reset(&self);
}

/// Wraps a closure capturing an `Rc<RefCell<M>>` module handle into a
/// [`Callback`]. The common way every stage subscribes its `process` (or
/// `passThrough`/`writeOutput`) method to one of its input ports.
pub fn callback<M: 'static>(module: &Rc<RefCell<M>>, f: impl Fn(&mut M) + 'static) -> Callback {
    let module = Rc::clone(module);
    Rc::new(RefCell::new(move || f(&mut module.borrow_mut())))
}

/// Same as [`callback`], but for stable hooks that may raise a [`CoreError`].
pub fn stable_hook<M: 'static>(
    module: &Rc<RefCell<M>>,
    f: impl Fn(&mut M) -> CoreResult<()> + 'static,
) -> StableHook {
    let module = Rc::clone(module);
    Rc::new(RefCell::new(move || f(&mut module.borrow_mut())))
}

/// Upper bound on callback drains per cycle. A well-formed graph never
/// comes close: each re-enqueue requires an actual port-value change, and
/// every port holds a single value, so propagation is naturally finite.
/// This bound exists purely to turn a modeling bug (an oscillating graph)
/// into a reported [`CoreError::FunctioningViolation`] instead of a hang.
const MAX_PROPAGATION_STEPS: usize = 1 << 20;

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<Callback>,
}

/// A cheap, shareable handle to the kernel's pending-callback queue. Ports
/// hold a clone of this so that `write` can enqueue subscribers without
/// needing a back-reference to the whole [`Kernel`].
#[derive(Clone, Default)]
pub struct CallbackQueue(Rc<RefCell<QueueInner>>);

impl CallbackQueue {
    pub fn enqueue(&self, cb: Callback) {
        self.0.borrow_mut().pending.push_back(cb);
    }

    /// Number of callbacks currently pending. Mainly useful for tests that
    /// want to assert a write did (or didn't) schedule anything without
    /// running a full kernel step.
    pub fn pending_count(&self) -> usize {
        self.0.borrow().pending.len()
    }
}

pub struct Kernel {
    queue: CallbackQueue,
    clocked: RefCell<Vec<Rc<dyn Clocked>>>,
    stable_hooks: RefCell<Vec<StableHook>>,
    cycle: Cell<u64>,
    fault: Cell<Option<FaultSpec>>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            queue: CallbackQueue::default(),
            clocked: RefCell::new(Vec::new()),
            stable_hooks: RefCell::new(Vec::new()),
            cycle: Cell::new(0),
            fault: Cell::new(None),
        }
    }

    /// Handle used by [`crate::port::Port`] to enqueue subscribers on write.
    pub fn queue(&self) -> CallbackQueue {
        self.queue.clone()
    }

    /// Schedules a callback to run at the start of the very next
    /// propagation round. Used during the bind phase to prime every
    /// module's first evaluation from its power-on defaults (see
    /// `Module::init` sites), since nothing has "changed" yet to trigger a
    /// write-driven enqueue.
    pub fn schedule(&self, cb: Callback) {
        self.queue.enqueue(cb);
    }

    pub fn register_clocked(&self, elem: Rc<dyn Clocked>) {
        self.clocked.borrow_mut().push(elem);
    }

    pub fn register_stable_hook(&self, hook: StableHook) {
        self.stable_hooks.borrow_mut().push(hook);
    }

    /// Number of cycles (ticks) completed so far. 0 during the first
    /// cycle's propagation.
    pub fn cycle(&self) -> u64 {
        self.cycle.get()
    }

    pub fn set_fault(&self, fault: Option<FaultSpec>) {
        self.fault.set(fault);
    }

    pub fn fault(&self) -> Option<FaultSpec> {
        self.fault.get()
    }

    /// Drains the pending callback queue to a fixed point, runs the stable
    /// hooks, ticks every clocked element, and advances the cycle counter.
    pub fn step(&self) -> CoreResult<()> {
        self.propagate()?;

        for hook in self.stable_hooks.borrow().iter() {
            (hook.borrow_mut())()?;
        }

        for elem in self.clocked.borrow().iter() {
            elem.tick()?;
        }

        self.cycle.set(self.cycle.get() + 1);
        Ok(())
    }

    fn propagate(&self) -> CoreResult<()> {
        let mut iterations = 0usize;
        loop {
            let next = self.queue.0.borrow_mut().pending.pop_front();
            let Some(cb) = next else { break };
            (cb.borrow_mut())();
            iterations += 1;
            if iterations > MAX_PROPAGATION_STEPS {
                return Err(CoreError::FunctioningViolation(
                    "propagation did not reach a fixed point".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Repeats `step` until either `n` cycles elapse or a fatal exception
    /// propagates.
    pub fn run(&self, n: u64) -> CoreResult<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Resets clocked elements to power-on defaults and zeros the cycle
    /// counter. Does not release registration (see [`Kernel::clear`]).
    pub fn reset(&self) {
        for elem in self.clocked.borrow().iter() {
            elem.reset();
        }
        self.cycle.set(0);
        self.queue.0.borrow_mut().pending.clear();
    }

    /// Releases all registered clocked elements and stable hooks, so a
    /// fresh simulation can be built from scratch in the same process
    /// (matches `Simulator.globalSim.clear()` in the original source).
    pub fn clear(&self) {
        self.clocked.borrow_mut().clear();
        self.stable_hooks.borrow_mut().clear();
        self.queue.0.borrow_mut().pending.clear();
        self.cycle.set(0);
        self.fault.set(None);
    }
}
