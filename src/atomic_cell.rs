use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A copy-on-write publication cell: writers clone the current value, mutate the clone and
///  publish it with a CAS, while readers take a snapshot with a single atomic load and no
///  lock. This is the right trade-off for values that are read on every datagram but
///  change only when a handler is registered or removed.
pub struct AtomicCell<T> {
    cell: AtomicPtr<Arc<T>>,
}

impl<T: Clone + Default + Send + Sync> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + Sync> AtomicCell<T> {
    pub fn new(value: T) -> AtomicCell<T> {
        let raw = Box::into_raw(Box::new(Arc::new(value)));
        AtomicCell {
            cell: AtomicPtr::new(raw),
        }
    }

    pub fn load(&self) -> Arc<T> {
        unsafe { (*self.cell.load(Ordering::Acquire)).clone() }
    }

    pub fn update(&self, f: impl Fn(&mut T)) {
        loop {
            let old = self.cell.load(Ordering::Acquire);

            let mut value: T = unsafe { (**old).clone() };
            f(&mut value);
            let new = Box::into_raw(Box::new(Arc::new(value)));

            match self
                .cell
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => {
                    unsafe {
                        drop(Box::from_raw(prev));
                    }
                    return;
                }
                Err(_) => unsafe {
                    drop(Box::from_raw(new));
                },
            }
        }
    }
}

impl<T> Drop for AtomicCell<T> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.cell.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
        }
    }
}
