//! Timer service: fire a callback after a delay, with deterministic cancel.
//!
//! Timers go into one global deadline-ordered queue served by lazily spawned
//! sleeper threads; a sleeper exits when the queue drains, so idle processes
//! carry no timer threads at all. Dropping a [`Timer`] cancels it, blocking
//! until the callback finishes if it is already mid-flight. A
//! [`TimerHolder`] groups timers so a paused isolate's timeouts stretch by
//! exactly the time spent paused.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type TimerFn = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    deadline: Instant,
    holder: Option<usize>,
    callback: Option<TimerFn>,
}

struct Service {
    entries: Vec<Entry>,
    /// Ids of callbacks currently executing on a sleeper thread.
    running: Vec<u64>,
    /// (holder id, paused-at) pairs.
    paused: Vec<(usize, Instant)>,
    idle_sleepers: usize,
    next_id: u64,
}

static SERVICE: Mutex<Service> = Mutex::new(Service {
    entries: Vec::new(),
    running: Vec::new(),
    paused: Vec::new(),
    idle_sleepers: 0,
    next_id: 1,
});
static CONDVAR: Condvar = Condvar::new();

fn holder_is_paused(service: &Service, holder: Option<usize>) -> bool {
    match holder {
        Some(id) => service.paused.iter().any(|(h, _)| *h == id),
        None => false,
    }
}

fn schedule(deadline: Instant, holder: Option<usize>, callback: TimerFn) -> u64 {
    let mut service = SERVICE.lock();
    let id = service.next_id;
    service.next_id += 1;
    service.entries.push(Entry {
        id,
        deadline,
        holder,
        callback: Some(callback),
    });
    if service.idle_sleepers == 0 {
        std::thread::Builder::new()
            .name("islet-timer".to_string())
            .spawn(sleeper_entry)
            .ok();
    } else {
        CONDVAR.notify_all();
    }
    id
}

fn sleeper_entry() {
    let mut service = SERVICE.lock();
    loop {
        if service.entries.is_empty() {
            return;
        }
        let now = Instant::now();
        let next = service
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !holder_is_paused(&service, e.holder))
            .min_by_key(|(_, e)| e.deadline)
            .map(|(i, e)| (i, e.deadline));
        match next {
            Some((index, deadline)) if deadline <= now => {
                let mut entry = service.entries.swap_remove(index);
                let id = entry.id;
                service.running.push(id);
                drop(service);
                if let Some(callback) = entry.callback.take() {
                    callback();
                }
                service = SERVICE.lock();
                service.running.retain(|&r| r != id);
                CONDVAR.notify_all();
            }
            Some((_, deadline)) => {
                service.idle_sleepers += 1;
                CONDVAR.wait_until(&mut service, deadline);
                service.idle_sleepers -= 1;
            }
            None => {
                // Everything is paused; park until a resume or a new timer.
                service.idle_sleepers += 1;
                CONDVAR.wait(&mut service);
                service.idle_sleepers -= 1;
            }
        }
    }
}

/// A scheduled callback. Dropping cancels; if the callback is already
/// running, drop blocks until it completes.
pub struct Timer {
    id: u64,
}

impl Timer {
    pub fn new(
        delay: Duration,
        holder: Option<&TimerHolder>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Timer {
        let id = schedule(
            Instant::now() + delay,
            holder.map(TimerHolder::key),
            Box::new(callback),
        );
        Timer { id }
    }

    /// Fire-and-forget: no handle, no cancel.
    pub fn wait_detached(delay: Duration, callback: impl FnOnce() + Send + 'static) {
        schedule(Instant::now() + delay, None, Box::new(callback));
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut service = SERVICE.lock();
        if let Some(index) = service.entries.iter().position(|e| e.id == self.id) {
            service.entries.swap_remove(index);
            return;
        }
        while service.running.contains(&self.id) {
            CONDVAR.wait(&mut service);
        }
    }
}

/// Groups timers whose deadlines stretch while the holder is paused.
#[derive(Clone, Default)]
pub struct TimerHolder {
    inner: Arc<HolderInner>,
}

#[derive(Default)]
struct HolderInner {}

impl TimerHolder {
    pub fn new() -> TimerHolder {
        TimerHolder::default()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Stop the clock for this holder's timers.
    pub fn pause(&self) {
        let mut service = SERVICE.lock();
        let key = self.key();
        if !service.paused.iter().any(|(h, _)| *h == key) {
            service.paused.push((key, Instant::now()));
        }
    }

    /// Resume, shifting every associated deadline by the paused duration.
    pub fn resume(&self) {
        let mut service = SERVICE.lock();
        let key = self.key();
        if let Some(index) = service.paused.iter().position(|(h, _)| *h == key) {
            let (_, paused_at) = service.paused.swap_remove(index);
            let shift = paused_at.elapsed();
            for entry in service.entries.iter_mut() {
                if entry.holder == Some(key) {
                    entry.deadline += shift;
                }
            }
            CONDVAR.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = Timer::new(Duration::from_millis(10), None, move || {
            flag.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_cancels_pending() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = Timer::new(Duration::from_secs(60), None, move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(timer);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn detached_timers_fire() {
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            Timer::wait_detached(Duration::from_millis(5), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pause_delays_firing() {
        let holder = TimerHolder::new();
        holder.pause();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = Timer::new(Duration::from_millis(10), Some(&holder), move || {
            flag.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst), "paused timer must not fire");
        holder.resume();
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
    }
}
