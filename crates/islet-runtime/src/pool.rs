//! Bounded worker pool with soft thread affinity.
//!
//! Work items prefer to land on a thread they have run on before, so
//! per-thread engine metadata stays warm. When every pool thread is busy and
//! the pool is at its size cap, the work runs on a freshly spawned detached
//! thread instead; such work is told `pool_thread = false` so the caller can
//! discard per-thread state afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

/// A unit of pool work. The flag tells the entry whether it ran on a pool
/// thread (true) or an overflow thread (false).
pub type PoolEntry = Box<dyn FnOnce(bool) + Send>;

/// Soft affinity: the set of pool threads this work has used before. Owned
/// by the scheduler of the isolate the work belongs to.
#[derive(Default)]
pub struct Affinity {
    ids: Vec<usize>,
    previous: Option<usize>,
}

struct Worker {
    sender: Sender<PoolEntry>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub struct ThreadPool {
    desired_size: usize,
    workers: Mutex<Vec<Worker>>,
}

impl ThreadPool {
    pub fn new(desired_size: usize) -> ThreadPool {
        ThreadPool {
            desired_size: desired_size.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Run `entry` exactly once, preferring threads in `affinity`.
    pub fn exec(&self, affinity: &mut Affinity, entry: PoolEntry) {
        let mut workers = self.workers.lock();

        let pick = Self::pick_worker(&workers, affinity);
        let index = match pick {
            Some(index) => Some(index),
            None if workers.len() < self.desired_size => {
                let index = workers.len();
                workers.push(Self::spawn_worker(index));
                Some(index)
            }
            None => None,
        };

        match index {
            Some(index) => {
                let worker = &workers[index];
                // Claimed under the pool lock so concurrent exec() calls
                // cannot double-book the thread.
                worker.busy.store(true, Ordering::Release);
                if let Err(returned) = worker.sender.send(entry) {
                    // Worker died; run detached rather than lose the work.
                    Self::spawn_overflow(returned.0);
                    return;
                }
                if !affinity.ids.contains(&index) {
                    affinity.ids.push(index);
                }
                affinity.previous = Some(index);
            }
            None => {
                drop(workers);
                Self::spawn_overflow(entry);
            }
        }
    }

    fn pick_worker(workers: &[Worker], affinity: &Affinity) -> Option<usize> {
        let idle = |index: &usize| -> bool {
            workers
                .get(*index)
                .map(|w| !w.busy.load(Ordering::Acquire))
                .unwrap_or(false)
        };
        if let Some(previous) = affinity.previous.filter(idle) {
            return Some(previous);
        }
        if let Some(&id) = affinity.ids.iter().find(|id| idle(id)) {
            return Some(id);
        }
        workers
            .iter()
            .position(|w| !w.busy.load(Ordering::Acquire))
    }

    fn spawn_worker(index: usize) -> Worker {
        let (sender, receiver) = unbounded::<PoolEntry>();
        let busy = Arc::new(AtomicBool::new(false));
        let busy_flag = Arc::clone(&busy);
        let handle = std::thread::Builder::new()
            .name(format!("islet-pool-{}", index))
            .spawn(move || {
                debug!(worker = index, "pool worker starting");
                while let Ok(entry) = receiver.recv() {
                    entry(true);
                    busy_flag.store(false, Ordering::Release);
                }
                debug!(worker = index, "pool worker stopped");
            })
            .ok();
        Worker {
            sender,
            busy,
            handle,
        }
    }

    fn spawn_overflow(entry: PoolEntry) {
        std::thread::Builder::new()
            .name("islet-pool-overflow".to_string())
            .spawn(move || entry(false))
            .ok();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            // Closing the channel ends the worker loop.
            let (closed, _) = unbounded::<PoolEntry>();
            worker.sender = closed;
        }
        let handles: Vec<_> = workers.iter_mut().filter_map(|w| w.handle.take()).collect();
        drop(workers);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn executes_every_entry_once() {
        let pool = ThreadPool::new(2);
        let count = Arc::new(AtomicU32::new(0));
        let mut affinity = Affinity::default();
        for _ in 0..8 {
            let count = Arc::clone(&count);
            pool.exec(
                &mut affinity,
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn repeat_work_prefers_same_thread() {
        let pool = ThreadPool::new(4);
        let mut affinity = Affinity::default();
        let first = Arc::new(Mutex::new(None::<std::thread::ThreadId>));
        let again = Arc::new(Mutex::new(None::<std::thread::ThreadId>));

        let slot = Arc::clone(&first);
        pool.exec(
            &mut affinity,
            Box::new(move |_| {
                *slot.lock() = Some(std::thread::current().id());
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        let slot = Arc::clone(&again);
        pool.exec(
            &mut affinity,
            Box::new(move |_| {
                *slot.lock() = Some(std::thread::current().id());
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        let a = first.lock().expect("first run");
        let b = again.lock().expect("second run");
        assert_eq!(a, b);
    }

    #[test]
    fn overflow_runs_detached() {
        let pool = ThreadPool::new(1);
        let mut blocker_affinity = Affinity::default();
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        pool.exec(
            &mut blocker_affinity,
            Box::new(move |_| {
                while !gate.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }),
        );

        let saw_pool_thread = Arc::new(Mutex::new(None::<bool>));
        let slot = Arc::clone(&saw_pool_thread);
        let mut affinity = Affinity::default();
        pool.exec(
            &mut affinity,
            Box::new(move |pool_thread| {
                *slot.lock() = Some(pool_thread);
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        release.store(true, Ordering::Release);
        assert_eq!(*saw_pool_thread.lock(), Some(false));
    }
}
