//! Single-value handoff between the capture thread and the consumer task.

use std::sync::{Mutex, PoisonError};

/// Holds at most one value. A new value replaces an unread one.
///
/// The lock is held only while moving a value in or out.
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Store `value`, returning the unread value it replaced.
    pub fn put(&self, value: T) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_empty() {
        let slot: LatestSlot<u32> = LatestSlot::new();
        assert!(slot.is_empty());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_latest_wins() {
        let slot = LatestSlot::new();
        assert_eq!(slot.put(1), None);
        assert_eq!(slot.put(2), Some(1));
        assert_eq!(slot.put(3), Some(2));
        assert_eq!(slot.take(), Some(3));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_survives_poisoned_lock() {
        let slot = Arc::new(LatestSlot::new());
        slot.put(7u32);

        let poisoner = Arc::clone(&slot);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poison the slot");
        })
        .join();

        assert_eq!(slot.take(), Some(7));
        assert_eq!(slot.put(8), None);
    }

    #[test]
    fn test_concurrent_producer_never_queues() {
        let slot = Arc::new(LatestSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                let mut replaced = 0;
                for i in 0..1000u32 {
                    if slot.put(i).is_some() {
                        replaced += 1;
                    }
                }
                replaced
            })
        };

        let mut taken = Vec::new();
        while !producer.is_finished() {
            if let Some(v) = slot.take() {
                taken.push(v);
            }
        }
        let replaced = producer.join().unwrap();
        taken.extend(slot.take());

        assert_eq!(taken.len() + replaced, 1000);
        assert!(taken.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(taken.last(), Some(&999));
    }
}
