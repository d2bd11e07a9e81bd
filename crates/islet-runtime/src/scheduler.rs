//! Per-isolate task queues and run-state arbitration.
//!
//! Four FIFO queues, in drain order: handle tasks (bookkeeping that must run
//! even while disposal is being prepared), interrupts, then regular tasks.
//! Sync interrupts are reserved for the root isolate's synchronous path and
//! drain through a separate interrupt identity. The `Waiting → Running`
//! transition is the only worker-admission control: whichever caller flips
//! it owns dispatch until the queues drain.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::environment::IsolateEnvironment;
use crate::lockable::Waitable;
use crate::pool::Affinity;

/// Work that runs entered into an isolate.
pub(crate) trait Runnable: Send {
    fn run(self: Box<Self>, scope: &RunScope<'_>);
}

impl<F> Runnable for F
where
    F: for<'a> FnOnce(&RunScope<'a>) + Send,
{
    fn run(self: Box<Self>, scope: &RunScope<'_>) {
        (*self)(scope)
    }
}

/// The view a task gets while running: its environment plus the locked
/// engine. Engine values obtained through this must not outlive it.
pub(crate) struct RunScope<'a> {
    pub env: &'a Arc<IsolateEnvironment>,
    pub iso: &'a islet_engine::Isolate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Waiting,
    Running,
}

pub(crate) struct SchedulerState {
    pub status: Status,
    pub tasks: VecDeque<Box<dyn Runnable>>,
    pub handle_tasks: VecDeque<Box<dyn Runnable>>,
    pub interrupts: VecDeque<Box<dyn Runnable>>,
    pub sync_interrupts: VecDeque<Box<dyn Runnable>>,
    pub affinity: Affinity,
}

#[derive(Default)]
struct WaitSlot {
    active: bool,
    ready: bool,
    done: bool,
}

pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
    wait: Waitable<WaitSlot>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            state: Mutex::new(SchedulerState {
                status: Status::Waiting,
                tasks: VecDeque::new(),
                handle_tasks: VecDeque::new(),
                interrupts: VecDeque::new(),
                sync_interrupts: VecDeque::new(),
                affinity: Affinity::default(),
            }),
            wait: Waitable::new(WaitSlot::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock()
    }

    /// Swap every queue out under one lock acquisition.
    pub fn take_all(
        &self,
    ) -> (
        VecDeque<Box<dyn Runnable>>,
        VecDeque<Box<dyn Runnable>>,
        VecDeque<Box<dyn Runnable>>,
    ) {
        let mut state = self.state.lock();
        (
            std::mem::take(&mut state.handle_tasks),
            std::mem::take(&mut state.interrupts),
            std::mem::take(&mut state.tasks),
        )
    }

    pub fn take_interrupts(&self) -> VecDeque<Box<dyn Runnable>> {
        std::mem::take(&mut self.state.lock().interrupts)
    }

    pub fn take_sync_interrupts(&self) -> VecDeque<Box<dyn Runnable>> {
        std::mem::take(&mut self.state.lock().sync_interrupts)
    }

    /// End a dispatch iteration: if every queue is empty, flip back to
    /// `Waiting` and report `true` so the worker releases its loop ref.
    pub fn done_if_drained(&self) -> bool {
        let mut state = self.state.lock();
        let drained = state.tasks.is_empty()
            && state.handle_tasks.is_empty()
            && state.interrupts.is_empty();
        if drained {
            state.status = Status::Waiting;
        }
        drained
    }

    // ---- Async wait (promise-bridged synchronous calls) ----

    /// Register the wait slot. Only one async wait may be active at a time.
    pub fn begin_async_wait(&self) {
        let mut slot = self.wait.lock();
        slot.active = true;
        slot.ready = false;
        slot.done = false;
    }

    /// Park until [`wake_async_wait`](Self::wake_async_wait).
    pub fn async_wait(&self) {
        let mut slot = self.wait.lock();
        slot.ready = true;
        self.wait.wait_until(&mut slot, |slot| slot.done);
    }

    /// Release the parked waiter (promise settled, or timeout cancel).
    pub fn wake_async_wait(&self) {
        let mut slot = self.wait.lock();
        slot.done = true;
        let ready = slot.ready;
        drop(slot);
        if ready {
            self.wait.notify_all();
        }
    }

    pub fn end_async_wait(&self) {
        let mut slot = self.wait.lock();
        slot.active = false;
    }

    /// Cancel any in-flight async wait; used by timeouts and disposal.
    pub fn cancel_async(&self) {
        let slot = self.wait.lock();
        if slot.active {
            drop(slot);
            self.wake_async_wait();
        }
    }
}
