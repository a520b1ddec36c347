//! Bulk encryption page pool.
//!
//! A process-wide cache of fixed-size pages handed out in bulk to RPC bulk
//! descriptors. The pool grows on demand up to a fixed capacity, can be
//! shrunk by an external memory-pressure source (see [`crate::shrink`]),
//! and parks request threads when pages run short.
//!
//! Pages live in a virtual array of `total_pages` slots addressed as
//! (segment, offset). Free pages always occupy the low end of that array:
//! slots `[0, free_pages)` hold pages and every slot at or above
//! `free_pages` is empty.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::bulk::BulkDesc;
use crate::config::{physical_pages, PoolConfig};
use crate::error::{ConfigError, PoolError};
use crate::page::{HeapPageAllocator, Page, PageAllocator};
use crate::stats::{PoolCounters, PoolStats};

/// Upper bound of the idle index.
pub const IDLE_IDX_MAX: u64 = 100;

/// History weight of the idle index moving average.
pub const IDLE_IDX_WEIGHT: u64 = 3;

/// Who is asking for pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    /// A thread issuing its own request; may sleep until pages show up.
    Request,
    /// A shared worker thread; must never sleep on the pool.
    Background,
}

pub(crate) struct PoolState {
    pools: Vec<Vec<Option<Page>>>,
    pub(crate) total_pages: usize,
    pub(crate) free_pages: usize,
    waitqlen: usize,
    pages_short: usize,
    growing: bool,
    pub(crate) idle_idx: u64,
    pub(crate) last_shrink: Instant,
    pub(crate) last_access: Instant,
    pub(crate) st: PoolCounters,
}

impl PoolState {
    fn slot(&mut self, idx: usize, pages_per_pool: usize) -> &mut Option<Page> {
        &mut self.pools[idx / pages_per_pool][idx % pages_per_pool]
    }
}

/// The shared bulk page pool.
pub struct EncPagePool {
    page_size: usize,
    pages_per_pool: usize,
    max_pages: usize,
    max_pools: usize,
    max_brw_pages: usize,
    quiescent_period: Duration,
    allocator: Box<dyn PageAllocator>,
    state: Mutex<PoolState>,
    waitq: Condvar,
    add_pages_lock: Mutex<()>,
}

impl std::fmt::Debug for EncPagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncPagePool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn npages_to_npools(npages: usize, pages_per_pool: usize) -> usize {
    npages.div_ceil(pages_per_pool)
}

impl EncPagePool {
    /// Builds an empty pool backed by the process heap.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::with_allocator(config, Box::new(HeapPageAllocator))
    }

    /// Builds an empty pool that grows from `allocator`.
    pub fn with_allocator(
        config: PoolConfig,
        allocator: Box<dyn PageAllocator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let max_pages = config.resolved_max_pages();
        let max_pools = npages_to_npools(max_pages, config.pages_per_pool);
        let now = Instant::now();

        debug!(
            max_pages,
            max_pools,
            pages_per_pool = config.pages_per_pool,
            page_size = config.page_size,
            "initialized enc page pool"
        );

        Ok(Self {
            page_size: config.page_size,
            pages_per_pool: config.pages_per_pool,
            max_pages,
            max_pools,
            max_brw_pages: config.max_brw_pages,
            quiescent_period: config.quiescent_period(),
            allocator,
            state: Mutex::new(PoolState {
                pools: Vec::new(),
                total_pages: 0,
                free_pages: 0,
                waitqlen: 0,
                pages_short: 0,
                growing: false,
                idle_idx: 0,
                last_shrink: now,
                last_access: now,
                st: PoolCounters::default(),
            }),
            waitq: Condvar::new(),
            add_pages_lock: Mutex::new(()),
        })
    }

    /// Capacity in pages.
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Size of each pool page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages in one maximal bulk transfer; also the shrink floor.
    pub fn max_brw_pages(&self) -> usize {
        self.max_brw_pages
    }

    pub(crate) fn quiescent_period(&self) -> Duration {
        self.quiescent_period
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    /// Pages currently free.
    pub fn free_pages(&self) -> usize {
        self.state.lock().free_pages
    }

    /// Pages currently committed.
    pub fn total_pages(&self) -> usize {
        self.state.lock().total_pages
    }

    /// Returns `true` once the pool has grown to its capacity.
    pub fn is_at_full_capacity(&self) -> bool {
        self.state.lock().total_pages == self.max_pages
    }

    /// Registers a pool user, pre-filling an empty pool with two bulk
    /// transfers' worth of pages. Further sizing is left to demand.
    pub fn add_user(&self) -> Result<(), PoolError> {
        let need_grow = {
            let mut st = self.state.lock();
            if !st.growing && st.total_pages == 0 {
                st.growing = true;
                true
            } else {
                false
            }
        };

        if need_grow {
            let grown = self.add_pages(self.max_brw_pages * 2);
            let mut st = self.state.lock();
            st.growing = false;
            self.wakeup(&st);
            grown?;
        }
        Ok(())
    }

    /// Unregisters a pool user. Pages stay cached until shrunk.
    pub fn del_user(&self) {}

    /// Attaches `desc.iov_count()` pool pages to `desc`.
    ///
    /// Does nothing if `desc` already holds pages (a resent bulk). When pages
    /// are short the caller grows the pool itself if nobody else is growing;
    /// otherwise a [`CallerRole::Request`] caller sleeps until pages are
    /// returned or added, while a [`CallerRole::Background`] caller gets
    /// [`PoolError::OutOfMemory`] at once.
    pub fn get_pages(&self, desc: &mut BulkDesc, role: CallerRole) -> Result<(), PoolError> {
        if desc.holds_pages() {
            return Ok(());
        }

        let count = desc.iov_count();
        if count == 0 {
            return Err(PoolError::InvalidRequest("descriptor needs no pages".into()));
        }

        let mut st = self.state.lock();
        if count > self.max_pages {
            st.st.outofmem += 1;
            return Err(self.out_of_memory(&st, count));
        }

        let mut pages = Vec::new();
        if pages.try_reserve_exact(count).is_err() {
            st.st.outofmem += 1;
            return Err(self.out_of_memory(&st, count));
        }

        st.st.access += 1;
        let mut this_idle = None;
        let mut wait_start = None;

        while st.free_pages < count {
            wait_start.get_or_insert_with(Instant::now);
            st.st.missings += 1;
            st.pages_short += count;

            if self.should_grow(&st) {
                st.growing = true;
                let want = st.pages_short / 2;
                let grown = MutexGuard::unlocked(&mut st, || self.add_pages(want));
                st.growing = false;
                self.wakeup(&st);

                if grown.is_err() {
                    st.pages_short -= count;
                    st.st.outofmem += 1;
                    return Err(self.out_of_memory(&st, count));
                }
            } else if role == CallerRole::Request
                && (st.growing || st.total_pages >= self.max_pages)
            {
                st.waitqlen += 1;
                if st.waitqlen > st.st.max_wqlen {
                    st.st.max_wqlen = st.waitqlen;
                }
                self.waitq.wait(&mut st);
                assert!(st.waitqlen > 0);
                st.waitqlen -= 1;
            } else {
                // background threads must not sleep here: the pages they
                // wait for may only come back through their own work
                st.pages_short -= count;
                st.st.outofmem += 1;
                debug!(count, free = st.free_pages, "background caller refused pool pages");
                return Err(self.out_of_memory(&st, count));
            }

            assert!(st.pages_short >= count);
            st.pages_short -= count;
            this_idle = Some(0);
        }

        if let Some(start) = wait_start {
            let waited = start.elapsed();
            if waited > st.st.max_wait {
                st.st.max_wait = waited;
            }
        }

        st.free_pages -= count;
        let base = st.free_pages;
        for i in 0..count {
            match st.slot(base + i, self.pages_per_pool).take() {
                Some(page) => pages.push(page),
                None => panic!("enc pool free slot {} is empty", base + i),
            }
        }

        if st.free_pages < st.st.lowfree {
            st.st.lowfree = st.free_pages;
        }

        // new idle index = (old * weight + new) / (weight + 1)
        let this_idle =
            this_idle.unwrap_or((st.free_pages as u64 * IDLE_IDX_MAX) / st.total_pages as u64);
        st.idle_idx = (st.idle_idx * IDLE_IDX_WEIGHT + this_idle) / (IDLE_IDX_WEIGHT + 1);
        st.last_access = Instant::now();
        drop(st);

        desc.attach(pages);
        Ok(())
    }

    /// Returns `desc`'s pool pages and wakes every waiter.
    pub fn put_pages(&self, desc: &mut BulkDesc) {
        let Some(pages) = desc.detach() else {
            return;
        };

        let mut st = self.state.lock();
        assert!(
            st.free_pages + pages.len() <= st.total_pages,
            "enc pool overflow: {} free + {} returned > {} total",
            st.free_pages,
            pages.len(),
            st.total_pages
        );

        let base = st.free_pages;
        let returned = pages.len();
        for (i, page) in pages.into_iter().enumerate() {
            assert_eq!(page.len(), self.page_size, "foreign page returned to enc pool");
            let slot = st.slot(base + i, self.pages_per_pool);
            assert!(slot.is_none(), "enc pool busy slot {} is occupied", base + i);
            *slot = Some(page);
        }
        st.free_pages += returned;
        self.wakeup(&st);
    }

    // one grower at a time, never past capacity
    fn should_grow(&self, st: &PoolState) -> bool {
        !st.growing && st.total_pages < self.max_pages
    }

    pub(crate) fn wakeup(&self, st: &PoolState) {
        if st.waitqlen > 0 {
            self.waitq.notify_all();
        }
    }

    fn out_of_memory(&self, st: &PoolState, requested: usize) -> PoolError {
        PoolError::OutOfMemory {
            requested,
            free: st.free_pages,
            total: st.total_pages,
        }
    }

    /// Adds at least `npages` pages, clamped up to a bulk transfer and the
    /// segment size and down to the remaining capacity.
    ///
    /// Allocation happens without the pool lock; a single failed page rolls
    /// back the whole batch.
    fn add_pages(&self, npages: usize) -> Result<usize, PoolError> {
        let _serialize = self.add_pages_lock.lock();

        let npages = {
            let mut st = self.state.lock();
            let room = self.max_pages - st.total_pages;
            let n = npages
                .max(self.max_brw_pages)
                .next_multiple_of(self.pages_per_pool)
                .min(room);
            if n == 0 {
                return Ok(0);
            }
            st.st.grows += 1;
            n
        };

        match self.alloc_batch(npages) {
            Some(batch) => {
                self.insert(batch, npages);
                debug!(npages, "added pages into enc pool");
                Ok(npages)
            }
            None => {
                self.state.lock().st.grow_fails += 1;
                error!(npages, "failed to allocate enc pool pages");
                Err(PoolError::GrowFailed { pages: npages })
            }
        }
    }

    fn alloc_batch(&self, npages: usize) -> Option<Vec<Vec<Page>>> {
        let npools = npages_to_npools(npages, self.pages_per_pool);
        let mut batch = Vec::new();
        batch.try_reserve_exact(npools).ok()?;

        let mut alloced = 0;
        for _ in 0..npools {
            let n = self.pages_per_pool.min(npages - alloced);
            let mut segment = Vec::new();
            segment.try_reserve_exact(n).ok()?;
            for _ in 0..n {
                segment.push(self.allocator.alloc_page(self.page_size)?);
            }
            alloced += n;
            batch.push(segment);
        }
        debug_assert_eq!(alloced, npages);
        Some(batch)
    }

    /// Merges freshly allocated pages: first into the empty slots of the
    /// existing segments, then as new segments.
    fn insert(&self, batch: Vec<Vec<Page>>, npages: usize) {
        let ppp = self.pages_per_pool;
        let mut st = self.state.lock();
        assert!(st.total_pages + npages <= self.max_pages);
        assert!(st.growing, "enc pool insert without grow in progress");

        let mut incoming: Vec<Page> = batch.into_iter().flatten().collect();
        assert_eq!(incoming.len(), npages);

        // (1) empty slots in current segments: the busy range and the tail
        let cur_npools = st.pools.len();
        let mut idx = st.free_pages;
        while idx < cur_npools * ppp {
            let Some(page) = incoming.pop() else {
                break;
            };
            let slot = st.slot(idx, ppp);
            assert!(slot.is_none());
            *slot = Some(page);
            idx += 1;
        }

        // (2) new segments
        let end_npools = npages_to_npools(st.total_pages + npages, ppp);
        assert!(end_npools <= self.max_pools);
        while st.pools.len() < end_npools {
            let take = ppp.min(incoming.len());
            let mut segment: Vec<Option<Page>> = incoming.drain(..take).map(Some).collect();
            segment.resize_with(ppp, || None);
            st.pools.push(segment);
        }
        assert!(incoming.is_empty());

        st.total_pages += npages;
        st.free_pages += npages;
        st.st.lowfree = st.free_pages;
        if st.total_pages > st.st.max_pages {
            st.st.max_pages = st.total_pages;
        }
        debug!(npages, total = st.total_pages, "grew enc pool");
    }

    /// Frees the `npages` highest free pages and any segment left wholly empty.
    pub(crate) fn release_free_pages(&self, st: &mut PoolState, npages: usize) {
        assert!(npages > 0);
        assert!(npages <= st.free_pages);
        assert!(st.free_pages <= st.total_pages);

        st.free_pages -= npages;
        st.total_pages -= npages;

        let base = st.free_pages;
        for i in 0..npages {
            let page = st.slot(base + i, self.pages_per_pool).take();
            assert!(page.is_some(), "enc pool free slot {} is empty", base + i);
        }

        let keep = npages_to_npools(st.total_pages, self.pages_per_pool);
        st.pools.truncate(keep);
    }

    /// A snapshot of sizes and counters.
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        let now = Instant::now();
        PoolStats {
            physical_pages: physical_pages(self.page_size),
            pages_per_pool: self.pages_per_pool,
            max_pages: self.max_pages,
            max_pools: self.max_pools,
            total_pages: st.total_pages,
            free_pages: st.free_pages,
            idle_idx: st.idle_idx,
            last_shrink_secs: now.duration_since(st.last_shrink).as_secs(),
            last_access_secs: now.duration_since(st.last_access).as_secs(),
            max_pages_reached: st.st.max_pages,
            grows: st.st.grows,
            grow_fails: st.st.grow_fails,
            shrinks: st.st.shrinks,
            cache_access: st.st.access,
            cache_missing: st.st.missings,
            low_free_mark: st.st.lowfree,
            max_waitqueue_depth: st.st.max_wqlen,
            max_wait_ms: st.st.max_wait.as_millis() as u64,
            out_of_mem: st.st.outofmem,
        }
    }
}

impl Drop for EncPagePool {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let st = self.state.get_mut();
        assert_eq!(
            st.total_pages, st.free_pages,
            "enc pool destroyed with {} pages still held by descriptors",
            st.total_pages - st.free_pages
        );

        let cleaned = st.pools.iter().flatten().filter(|s| s.is_some()).count();
        assert_eq!(cleaned, st.total_pages);

        if st.st.access > 0 {
            debug!(
                max_pages = st.st.max_pages,
                grows = st.st.grows,
                grow_fails = st.st.grow_fails,
                shrinks = st.st.shrinks,
                access = st.st.access,
                missing = st.st.missings,
                max_qlen = st.st.max_wqlen,
                max_wait_ms = st.st.max_wait.as_millis() as u64,
                out_of_mem = st.st.outofmem,
                "enc pool teardown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_memory_mb: None,
            max_pages: Some(64),
            page_size: 4096,
            pages_per_pool: 16,
            max_brw_pages: 4,
            quiescent_period_secs: 20,
        }
    }

    fn pool() -> EncPagePool {
        EncPagePool::new(small_config()).unwrap()
    }

    #[test]
    fn test_new_pool_is_empty() {
        let pool = pool();
        assert_eq!(pool.total_pages(), 0);
        assert_eq!(pool.free_pages(), 0);
        assert_eq!(pool.max_pages(), 64);
        assert!(!pool.is_at_full_capacity());
        assert_eq!(pool.stats().max_pools, 4);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PoolConfig {
            pages_per_pool: 0,
            ..small_config()
        };
        assert!(EncPagePool::new(config).is_err());
    }

    #[test]
    fn test_add_user_prefills_once() {
        let pool = pool();
        pool.add_user().unwrap();
        // 2 * 4 rounded up to a whole segment
        assert_eq!(pool.total_pages(), 16);
        assert_eq!(pool.free_pages(), 16);
        pool.add_user().unwrap();
        assert_eq!(pool.total_pages(), 16);
        pool.del_user();
        assert_eq!(pool.total_pages(), 16);
    }

    #[test]
    fn test_get_grows_and_put_returns() {
        let pool = pool();
        let mut desc = BulkDesc::new(10);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        assert_eq!(desc.held_pages(), 10);
        assert!(desc.enc_pages().unwrap().iter().all(|p| p.len() == 4096));
        let total = pool.total_pages();
        assert_eq!(total, 16);
        assert_eq!(pool.free_pages(), total - 10);

        pool.put_pages(&mut desc);
        assert!(!desc.holds_pages());
        assert_eq!(pool.free_pages(), total);

        let stats = pool.stats();
        assert_eq!(stats.grows, 1);
        assert_eq!(stats.cache_access, 1);
        assert_eq!(stats.cache_missing, 1);
        assert_eq!(stats.max_pages_reached, 16);
    }

    #[test]
    fn test_get_is_idempotent_while_held() {
        let pool = pool();
        let mut desc = BulkDesc::new(4);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        let free = pool.free_pages();
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        assert_eq!(pool.free_pages(), free);
        assert_eq!(desc.held_pages(), 4);
        pool.put_pages(&mut desc);
        pool.put_pages(&mut desc);
        assert_eq!(pool.free_pages(), pool.total_pages());
    }

    #[test]
    fn test_zero_page_request_is_invalid() {
        let pool = pool();
        let mut desc = BulkDesc::new(0);
        assert!(matches!(
            pool.get_pages(&mut desc, CallerRole::Request),
            Err(PoolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_above_capacity_is_refused() {
        let pool = pool();
        let mut desc = BulkDesc::new(65);
        let err = pool.get_pages(&mut desc, CallerRole::Request).unwrap_err();
        assert_eq!(
            err,
            PoolError::OutOfMemory {
                requested: 65,
                free: 0,
                total: 0
            }
        );
        assert_eq!(pool.stats().out_of_mem, 1);
    }

    #[test]
    fn test_request_exactly_capacity() {
        let pool = pool();
        let mut desc = BulkDesc::new(64);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        assert!(pool.is_at_full_capacity());
        assert_eq!(pool.free_pages(), 0);
        pool.put_pages(&mut desc);
        assert_eq!(pool.free_pages(), 64);
    }

    #[test]
    fn test_background_caller_never_waits() {
        let pool = pool();
        let mut held = BulkDesc::new(64);
        pool.get_pages(&mut held, CallerRole::Request).unwrap();

        let mut desc = BulkDesc::new(1);
        assert!(matches!(
            pool.get_pages(&mut desc, CallerRole::Background),
            Err(PoolError::OutOfMemory { requested: 1, .. })
        ));
        assert!(!desc.holds_pages());
        pool.put_pages(&mut held);
    }

    #[test]
    fn test_release_free_pages_drops_empty_segments() {
        let pool = pool();
        let mut desc = BulkDesc::new(40);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        pool.put_pages(&mut desc);
        assert_eq!(pool.total_pages(), 64);

        {
            let mut st = pool.lock();
            pool.release_free_pages(&mut st, 20);
            assert_eq!(st.total_pages, 44);
            assert_eq!(st.free_pages, 44);
            assert_eq!(st.pools.len(), 3);
        }

        let mut again = BulkDesc::new(44);
        pool.get_pages(&mut again, CallerRole::Request).unwrap();
        assert_eq!(pool.free_pages(), 0);
        pool.put_pages(&mut again);
    }

    #[test]
    fn test_grow_fills_holes_before_new_segments() {
        let pool = pool();
        let mut desc = BulkDesc::new(16);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        assert_eq!(pool.free_pages(), 0);
        pool.put_pages(&mut desc);
        {
            let mut st = pool.lock();
            pool.release_free_pages(&mut st, 6);
            assert_eq!(st.total_pages, 10);
            assert_eq!(st.pools.len(), 1);
        }

        let mut big = BulkDesc::new(20);
        pool.get_pages(&mut big, CallerRole::Request).unwrap();
        {
            let st = pool.lock();
            let filled = st.pools.iter().flatten().filter(|s| s.is_some()).count();
            assert_eq!(filled, st.free_pages);
            assert_eq!(st.pools.len(), npages_to_npools(st.total_pages, 16));
        }
        pool.put_pages(&mut big);
    }

    #[test]
    fn test_idle_index_tracks_free_ratio() {
        let pool = pool();
        pool.add_user().unwrap();
        for _ in 0..20 {
            let mut desc = BulkDesc::new(1);
            pool.get_pages(&mut desc, CallerRole::Request).unwrap();
            pool.put_pages(&mut desc);
        }
        // 15 of 16 free on every sample converges near 93
        let idle = pool.stats().idle_idx;
        assert!((85..=IDLE_IDX_MAX).contains(&idle), "idle {}", idle);
    }

    struct FailingAllocator;

    impl PageAllocator for FailingAllocator {
        fn alloc_page(&self, _page_size: usize) -> Option<Page> {
            None
        }
    }

    #[test]
    fn test_failed_grow_rolls_back() {
        let pool = EncPagePool::with_allocator(small_config(), Box::new(FailingAllocator)).unwrap();
        let mut desc = BulkDesc::new(4);
        assert!(matches!(
            pool.get_pages(&mut desc, CallerRole::Request),
            Err(PoolError::OutOfMemory { .. })
        ));
        assert_eq!(pool.total_pages(), 0);
        let stats = pool.stats();
        assert_eq!(stats.grows, 1);
        assert_eq!(stats.grow_fails, 1);
        assert_eq!(stats.out_of_mem, 1);
        assert_eq!(pool.add_user(), Err(PoolError::GrowFailed { pages: 16 }));
    }

    #[test]
    #[should_panic(expected = "still held by descriptors")]
    fn test_drop_with_outstanding_pages_panics() {
        let pool = pool();
        let mut desc = BulkDesc::new(2);
        pool.get_pages(&mut desc, CallerRole::Request).unwrap();
        drop(pool);
    }
}
