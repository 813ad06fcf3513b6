use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way shutdown flag shared between threads.
///
/// Only the first [`trip`](Self::trip) reports `true`, so a shutdown sequence
/// guarded by it runs exactly once no matter how many `die` commands arrive.
#[derive(Debug, Clone, Default)]
pub struct ShutdownLatch(Arc<AtomicBool>);

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch. Returns `true` only for the caller that tripped it.
    pub fn trip(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_trip_once() {
        let latch = ShutdownLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_tripped());
    }

    #[test]
    fn test_concurrent_trips_have_one_winner() {
        let latch = ShutdownLatch::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.trip())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
