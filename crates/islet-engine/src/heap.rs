//! Heap accounting for an isolate.
//!
//! The engine has no moving collector; liveness is reference counting. What
//! it does track is every byte handed to strings, objects and buffers, so an
//! embedder can cap an isolate's footprint. Charges are RAII: dropping the
//! last clone of a string or object returns its bytes to the heap.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::EngineError;

/// Callback invoked once, the first time an allocation fails against the
/// limit. Runs on the isolate's thread.
pub type NearHeapLimitCallback = Box<dyn Fn(usize)>;

pub(crate) struct Heap {
    used: Cell<usize>,
    limit: Cell<usize>,
    tripped: Cell<bool>,
    limit_callback: RefCell<Option<NearHeapLimitCallback>>,
}

impl Heap {
    pub fn new(limit: usize) -> Rc<Self> {
        Rc::new(Self {
            used: Cell::new(0),
            limit: Cell::new(limit),
            tripped: Cell::new(false),
            limit_callback: RefCell::new(None),
        })
    }

    /// Book `bytes` against the limit. The returned charge frees the bytes
    /// when dropped.
    pub fn charge(self: &Rc<Self>, bytes: usize) -> Result<HeapCharge, EngineError> {
        let next = self.used.get().saturating_add(bytes);
        if next > self.limit.get() {
            if !self.tripped.replace(true) {
                if let Some(callback) = self.limit_callback.borrow().as_ref() {
                    callback(next);
                }
            }
            return Err(EngineError::OutOfMemory);
        }
        self.used.set(next);
        Ok(HeapCharge {
            heap: Rc::clone(self),
            bytes,
        })
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    /// Whether an allocation has already failed against the limit.
    pub fn tripped(&self) -> bool {
        self.tripped.get()
    }

    pub fn set_limit_callback(&self, callback: NearHeapLimitCallback) {
        *self.limit_callback.borrow_mut() = Some(callback);
    }

    fn free(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }
}

/// RAII record of booked heap bytes.
pub(crate) struct HeapCharge {
    heap: Rc<Heap>,
    bytes: usize,
}

impl Drop for HeapCharge {
    fn drop(&mut self) {
        self.heap.free(self.bytes);
    }
}

impl std::fmt::Debug for HeapCharge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapCharge({})", self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release() {
        let heap = Heap::new(1024);
        let charge = heap.charge(512).unwrap();
        assert_eq!(heap.used(), 512);
        drop(charge);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn limit_enforced() {
        let heap = Heap::new(100);
        let _keep = heap.charge(80).unwrap();
        assert!(matches!(heap.charge(40), Err(EngineError::OutOfMemory)));
        assert!(heap.tripped());
    }

    #[test]
    fn limit_callback_fires_once() {
        let heap = Heap::new(10);
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        heap.set_limit_callback(Box::new(move |_| seen.set(seen.get() + 1)));
        let _ = heap.charge(100);
        let _ = heap.charge(100);
        assert_eq!(count.get(), 1);
    }
}
