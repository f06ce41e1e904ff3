//! Atomically swappable shared values.

use std::sync::{Arc, PoisonError, RwLock};

/// A shared value that is only ever replaced whole.
///
/// Readers take an `Arc` to the current value and keep using it for as long
/// as they need; a concurrent [`store`](Self::store) installs a new value
/// without disturbing them. Values are never mutated in place.
#[derive(Debug)]
pub struct ArcCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> ArcCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// The value installed most recently.
    pub fn load(&self) -> Arc<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `value`, returning the one it replaced.
    pub fn store(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }

    /// Derive the next value from the current one and install it.
    ///
    /// The write lock is held across `f`, so concurrent updates are applied
    /// one after another and none is lost. Returns the installed value, or
    /// the error from `f` with the cell left unchanged.
    pub fn update<E>(&self, f: impl FnOnce(&T) -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(f(&guard)?);
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

impl<T: Default> Default for ArcCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_does_not_disturb_readers() {
        let cell = ArcCell::new(vec![1, 2, 3]);
        let before = cell.load();
        let previous = cell.store(vec![4]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*previous, vec![1, 2, 3]);
        assert_eq!(*cell.load(), vec![4]);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let cell = Arc::new(ArcCell::new(0u32));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        cell.update(|n| Ok::<_, ()>(n + 1)).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*cell.load(), 1000);
    }

    #[test]
    fn test_failed_update_leaves_value() {
        let cell = ArcCell::new(7u32);
        assert_eq!(cell.update(|_| Err::<u32, _>("rejected")), Err("rejected"));
        assert_eq!(*cell.load(), 7);
        let installed = cell.update(|n| Ok::<_, ()>(n * 2)).unwrap();
        assert!(Arc::ptr_eq(&installed, &cell.load()));
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let cell = Arc::new(ArcCell::new((0u32, 0u32)));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..500u32 {
                    cell.store((i, i * 2));
                }
            })
        };
        for _ in 0..500 {
            let pair = cell.load();
            assert_eq!(pair.1, pair.0 * 2);
        }
        writer.join().unwrap();
    }
}
