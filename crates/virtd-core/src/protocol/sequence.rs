//! Thread-safe allocator for callback ids.
//!
//! # Why ids are never reused
//!
//! A client names a modern event subscription by the id the daemon returned
//! when it registered. Events already queued for a subscription carry that
//! id, so if a later subscription could receive the same number the client
//! would attribute stale events to it. Ids therefore come from a counter that
//! only moves forward for the lifetime of the connection.
//!
//! The counter uses `AtomicI32` so it can be bumped without taking the
//! connection lock.

use std::sync::atomic::{AtomicI32, Ordering};

/// A monotonically increasing source of callback ids, starting at 0.
///
/// Once the counter reaches `i32::MAX` it stops handing out ids rather than
/// wrapping back into the range of ids that may still be live.
///
/// # Examples
///
/// ```rust
/// use virtd_core::protocol::CallbackIdCounter;
///
/// let counter = CallbackIdCounter::new();
/// assert_eq!(counter.next(), Some(0));
/// assert_eq!(counter.next(), Some(1));
/// ```
#[derive(Debug)]
pub struct CallbackIdCounter {
    inner: AtomicI32,
}

impl CallbackIdCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicI32::new(0),
        }
    }

    /// Returns the next unused id, or `None` once the id space is exhausted.
    pub fn next(&self) -> Option<i32> {
        self.inner
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1))
            .ok()
    }

    /// Returns the id the next call to [`next`](Self::next) would hand out.
    pub fn current(&self) -> i32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for CallbackIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_zero() {
        // Arrange
        let counter = CallbackIdCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, Some(0));
    }

    #[test]
    fn test_counter_never_repeats() {
        // Arrange
        let counter = CallbackIdCounter::new();

        // Act
        let values: Vec<i32> = (0..100).filter_map(|_| counter.next()).collect();

        // Assert
        for window in values.windows(2) {
            assert!(window[1] > window[0], "ids must strictly increase");
        }
    }

    #[test]
    fn test_counter_stops_at_i32_max() {
        // Arrange
        let counter = CallbackIdCounter {
            inner: AtomicI32::new(i32::MAX - 1),
        };

        // Act
        let last = counter.next();
        let exhausted = counter.next();

        // Assert
        assert_eq!(last, Some(i32::MAX - 1));
        assert_eq!(exhausted, None, "counter must not wrap");
    }

    #[test]
    fn test_counter_is_thread_safe() {
        // Arrange
        let counter = Arc::new(CallbackIdCounter::new());

        // Act
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..500).filter_map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 500, "every id must be unique across threads");
    }

    #[test]
    fn test_current_does_not_advance() {
        let counter = CallbackIdCounter::new();
        counter.next();
        assert_eq!(counter.current(), 1);
        assert_eq!(counter.next(), Some(1));
    }
}
