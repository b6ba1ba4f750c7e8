//! Request id allocation.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

/// Wrapping 32-bit id counter that never hands out `0`.
#[derive(Debug, Default)]
pub(crate) struct IdGen(AtomicU32);

impl IdGen {
    /// Creates a counter whose next id is `last + 1` (skipping zero).
    #[cfg(test)]
    pub(crate) const fn starting_after(last: u32) -> Self {
        Self(AtomicU32::new(last))
    }

    /// Returns the next id.
    pub(crate) fn next(&self) -> NonZeroU32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(id) = NonZeroU32::new(id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let ids = IdGen::default();
        assert_eq!(ids.next().get(), 1);
        assert_eq!(ids.next().get(), 2);
    }

    #[test]
    fn skips_zero_on_wraparound() {
        let ids = IdGen::starting_after(u32::MAX - 1);
        assert_eq!(ids.next().get(), u32::MAX);
        assert_eq!(ids.next().get(), 1);
        assert_eq!(ids.next().get(), 2);
    }

    #[test]
    fn unique_across_threads() {
        let ids = IdGen::starting_after(u32::MAX - 500);
        let mut seen: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..250).map(|_| ids.next().get()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        });
        assert!(!seen.contains(&0));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
    }
}
