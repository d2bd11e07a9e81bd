//! Host-loop integration: one wake line into a dedicated pump thread that
//! drains the root isolate's queues, plus the loop-ref count that tracks
//! outstanding work across all isolates.
//!
//! The wake channel is the async-send analog: thread-safe, coalescing-free,
//! callable from any thread. Ref transitions through zero from non-root
//! threads post a wake so the root thread re-evaluates its queues before
//! going quiet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::environment::IsolateEnvironment;

enum HostMessage {
    Wake,
    Post(Box<dyn FnOnce() + Send>),
    Shutdown,
}

pub(crate) struct HostLoop {
    tx: Sender<HostMessage>,
    ref_count: AtomicUsize,
    idle: Mutex<()>,
    idle_cv: Condvar,
    root: OnceLock<Weak<IsolateEnvironment>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    pump_thread: OnceLock<std::thread::ThreadId>,
}

impl HostLoop {
    pub fn start() -> Arc<HostLoop> {
        let (tx, rx) = unbounded::<HostMessage>();
        let host = Arc::new(HostLoop {
            tx,
            ref_count: AtomicUsize::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            root: OnceLock::new(),
            pump: Mutex::new(None),
            pump_thread: OnceLock::new(),
        });
        let pump_host = Arc::clone(&host);
        let handle = std::thread::Builder::new()
            .name("islet-host-loop".to_string())
            .spawn(move || pump_host.pump_entry(rx))
            .ok();
        *host.pump.lock() = handle;
        host
    }

    /// Install the root environment; must happen before the first wake.
    pub fn set_root(&self, root: Weak<IsolateEnvironment>) {
        let _ = self.root.set(root);
    }

    fn pump_entry(self: Arc<Self>, rx: Receiver<HostMessage>) {
        let _ = self.pump_thread.set(std::thread::current().id());
        debug!("host loop starting");
        while let Ok(message) = rx.recv() {
            match message {
                HostMessage::Wake => {
                    let root = self.root.get().and_then(Weak::upgrade);
                    if let Some(root) = root {
                        root.async_entry(true);
                    }
                }
                HostMessage::Post(f) => f(),
                HostMessage::Shutdown => break,
            }
        }
        debug!("host loop stopped");
    }

    /// The async-send analog: schedule a drain of the root isolate.
    pub fn send_wake(&self) {
        let _ = self.tx.send(HostMessage::Wake);
    }

    /// Run a closure on the root thread.
    pub fn post(&self, f: Box<dyn FnOnce() + Send>) {
        let _ = self.tx.send(HostMessage::Post(f));
    }

    pub fn is_pump_thread(&self) -> bool {
        self.pump_thread
            .get()
            .map(|id| *id == std::thread::current().id())
            .unwrap_or(false)
    }

    // ---- Loop refs ----

    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_ref(&self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !self.is_pump_thread() {
                self.send_wake();
            }
            self.idle_cv.notify_all();
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Block until no isolate has outstanding work. Used at teardown.
    pub fn wait_idle(&self) {
        let mut guard = self.idle.lock();
        while self.ref_count.load(Ordering::Acquire) != 0 {
            self.idle_cv.wait_for(&mut guard, std::time::Duration::from_millis(50));
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(HostMessage::Shutdown);
        if let Some(handle) = self.pump.lock().take() {
            let _ = handle.join();
        }
    }
}
