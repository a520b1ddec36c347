//! Memory-pressure hooks.
//!
//! An external reclaimer first asks how many objects could be freed, then
//! asks for up to that many to be freed. The pool never shrinks below one
//! bulk transfer's worth of free pages, and offers less the busier it is.

use std::time::Instant;

use tracing::debug;

use crate::pool::{EncPagePool, PoolState, IDLE_IDX_MAX};

/// Something the host can ask to give memory back.
pub trait Shrinker: Send + Sync {
    /// How many objects `scan_objects` could free right now.
    fn count_objects(&self) -> usize;

    /// Frees up to `nr_to_scan` objects and returns how many were freed.
    fn scan_objects(&self, nr_to_scan: usize) -> usize;
}

impl EncPagePool {
    // an untouched pool is fully idle
    fn mark_idle_if_quiescent(&self, st: &mut PoolState) {
        if st.last_access.elapsed() > self.quiescent_period() {
            st.idle_idx = IDLE_IDX_MAX;
        }
    }

    fn reclaimable(&self, st: &PoolState) -> usize {
        st.free_pages.saturating_sub(self.max_brw_pages())
    }
}

impl Shrinker for EncPagePool {
    fn count_objects(&self) -> usize {
        let mut st = self.lock();
        self.mark_idle_if_quiescent(&mut st);

        // scaled by idle / IDLE_IDX_MAX, not the inverse (IDLE_IDX_MAX - idle):
        // a fully idle pool offers all spare pages, a saturated one none
        let spare = self.reclaimable(&st) as u64;
        (spare * st.idle_idx.min(IDLE_IDX_MAX) / IDLE_IDX_MAX) as usize
    }

    fn scan_objects(&self, nr_to_scan: usize) -> usize {
        let mut st = self.lock();
        let freed = nr_to_scan.min(self.reclaimable(&st));
        if freed > 0 {
            self.release_free_pages(&mut st, freed);
            st.st.shrinks += 1;
            st.last_shrink = Instant::now();
            debug!(
                freed,
                total = st.total_pages,
                free = st.free_pages,
                "shrank enc pool"
            );
        }

        self.mark_idle_if_quiescent(&mut st);
        self.wakeup(&st);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkDesc;
    use crate::config::PoolConfig;
    use crate::pool::CallerRole;

    fn pool(quiescent_period_secs: u64) -> EncPagePool {
        EncPagePool::new(PoolConfig {
            max_memory_mb: None,
            max_pages: Some(64),
            page_size: 4096,
            pages_per_pool: 16,
            max_brw_pages: 4,
            quiescent_period_secs,
        })
        .unwrap()
    }

    fn fill(pool: &EncPagePool) {
        let mut desc = BulkDesc::new(64);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        pool.put_pages(&mut desc);
    }

    #[test]
    fn test_empty_pool_offers_nothing() {
        let pool = pool(0);
        assert_eq!(pool.count_objects(), 0);
        assert_eq!(pool.scan_objects(100), 0);
        assert_eq!(pool.stats().shrinks, 0);
    }

    #[test]
    fn test_quiescent_pool_offers_all_above_floor() {
        let pool = pool(0);
        fill(&pool);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(pool.count_objects(), 60);
        assert_eq!(pool.stats().idle_idx, IDLE_IDX_MAX);
    }

    #[test]
    fn test_busy_pool_offers_nothing() {
        let pool = pool(3600);
        fill(&pool);
        // a fresh get with every page gone sets the index to zero
        assert_eq!(pool.stats().idle_idx, 0);
        assert_eq!(pool.count_objects(), 0);
    }

    #[test]
    fn test_scan_respects_floor() {
        let pool = pool(0);
        fill(&pool);
        assert_eq!(pool.scan_objects(1000), 60);
        assert_eq!(pool.total_pages(), 4);
        assert_eq!(pool.free_pages(), 4);
        assert_eq!(pool.scan_objects(1000), 0);

        let stats = pool.stats();
        assert_eq!(stats.shrinks, 1);
        assert_eq!(stats.max_pages_reached, 64);
    }

    #[test]
    fn test_partial_scan() {
        let pool = pool(0);
        fill(&pool);
        assert_eq!(pool.scan_objects(10), 10);
        assert_eq!(pool.total_pages(), 54);
        assert_eq!(pool.free_pages(), 54);
    }

    #[test]
    fn test_held_pages_are_not_reclaimed() {
        let pool = pool(0);
        fill(&pool);
        let mut desc = BulkDesc::new(50);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        assert_eq!(pool.scan_objects(1000), 10);
        assert_eq!(pool.free_pages(), 4);
        assert_eq!(pool.total_pages(), 54);
        pool.put_pages(&mut desc);
        assert_eq!(pool.free_pages(), 54);
    }
}
