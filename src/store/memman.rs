//! Process-wide accounting of cached value bytes, with watermarks that
//! drive eviction and, past the critical line, block allocation until the
//! sweep frees room.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::Notify;

/// Floor and ceiling for the adaptive idle-age eviction threshold.
const AGE_MIN_MS: u64 = 100;
const AGE_MAX_MS: u64 = 60_000;

/// Sweeps in a row that met their goal before the age threshold relaxes.
const EASY_STREAK: u32 = 10;

#[derive(Debug)]
pub struct MemGauge {
    max_bytes: u64,
    cached: AtomicU64,
    freed: Notify,

    /// Only values idle longer than this are evicted; halved when a sweep
    /// falls short, doubled after a long streak of easy sweeps.
    age_ms: AtomicU64,
    easy_sweeps: AtomicU32,
}

impl MemGauge {
    pub fn new(max_bytes: u64) -> Self {
        MemGauge {
            max_bytes,
            cached: AtomicU64::new(0),
            freed: Notify::new(),
            age_ms: AtomicU64::new(5_000),
            easy_sweeps: AtomicU32::new(0),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn cached(&self) -> u64 {
        self.cached.load(Ordering::Relaxed)
    }

    /// Above this, the sweeper starts evicting.
    pub fn hi_water(&self) -> u64 {
        self.max_bytes / 4 * 3
    }

    /// Eviction target: sweep down to here.
    pub fn lo_water(&self) -> u64 {
        self.max_bytes / 2
    }

    /// Above this, allocations block.
    pub fn critical_water(&self) -> u64 {
        self.max_bytes / 10 * 9
    }

    pub fn over_hi(&self) -> bool {
        self.cached() > self.hi_water()
    }

    pub fn critical(&self) -> bool {
        self.cached() > self.critical_water()
    }

    /// Current idle-age threshold for eviction candidates.
    pub fn evict_age_ms(&self) -> u64 {
        self.age_ms.load(Ordering::Relaxed)
    }

    /// Accounts freshly cached bytes, blocking past the critical line
    /// until the sweeper frees room. Caching more than the whole budget
    /// at once can never be satisfied and is admitted rather than
    /// deadlocked (the sweep will report it fatal).
    pub async fn alloc(&self, n: u64) {
        if n > self.critical_water() {
            self.cached.fetch_add(n, Ordering::SeqCst);
            return;
        }
        loop {
            let cur = self.cached.load(Ordering::SeqCst);
            if cur + n <= self.critical_water() {
                self.cached.fetch_add(n, Ordering::SeqCst);
                return;
            }
            pf_debug!(
                "allocation of {}B blocked at {}B cached",
                n,
                cur
            );
            self.freed.notified().await;
        }
    }

    /// Accounts bytes freed by eviction or overwrite.
    pub fn release(&self, n: u64) {
        self.cached.fetch_sub(n.min(self.cached()), Ordering::SeqCst);
        self.freed.notify_waiters();
    }

    /// Called by the sweeper after each eviction pass to adapt the age
    /// threshold. Returns true if the situation is hopeless: still
    /// critical with a full scan freeing nothing.
    #[must_use]
    pub fn sweep_feedback(&self, freed: u64) -> bool {
        if self.critical() && freed == 0 {
            return true;
        }
        if self.over_hi() {
            // falling short: get more aggressive next pass
            let age = self.age_ms.load(Ordering::Relaxed);
            self.age_ms
                .store((age / 2).max(AGE_MIN_MS), Ordering::Relaxed);
            self.easy_sweeps.store(0, Ordering::Relaxed);
        } else if self.easy_sweeps.fetch_add(1, Ordering::Relaxed) + 1
            >= EASY_STREAK
        {
            // comfortably under budget for a while: keep caches longer
            let age = self.age_ms.load(Ordering::Relaxed);
            self.age_ms
                .store((age * 2).min(AGE_MAX_MS), Ordering::Relaxed);
            self.easy_sweeps.store(0, Ordering::Relaxed);
        }
        false
    }
}

#[cfg(test)]
mod memman_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};

    #[test]
    fn watermark_ordering() {
        let g = MemGauge::new(1000);
        assert!(g.lo_water() < g.hi_water());
        assert!(g.hi_water() < g.critical_water());
        assert!(g.critical_water() < 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alloc_blocks_until_release() {
        let g = Arc::new(MemGauge::new(1000));
        g.alloc(850).await; // under critical (900)
        assert_eq!(g.cached(), 850);

        let g2 = g.clone();
        let blocked = tokio::spawn(async move {
            g2.alloc(200).await;
            g2.cached()
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        g.release(400);
        let after = blocked.await.unwrap();
        assert_eq!(after, 650);
    }

    #[test]
    fn feedback_tightens_then_relaxes() {
        let g = MemGauge::new(1000);
        let start = g.evict_age_ms();

        // over the high watermark and the sweep helped some: tighten
        g.cached.store(800, Ordering::SeqCst);
        assert!(!g.sweep_feedback(10));
        assert!(g.evict_age_ms() < start);

        // comfortable for a long streak: relax again
        g.cached.store(100, Ordering::SeqCst);
        let tightened = g.evict_age_ms();
        for _ in 0..EASY_STREAK {
            assert!(!g.sweep_feedback(0));
        }
        assert!(g.evict_age_ms() > tightened);
    }

    #[test]
    fn hopeless_sweep_is_fatal() {
        let g = MemGauge::new(1000);
        g.cached.store(950, Ordering::SeqCst);
        assert!(g.sweep_feedback(0));
        assert!(!g.sweep_feedback(1));
    }
}
