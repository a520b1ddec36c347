//! Page pool statistics.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Monotonic pool counters, kept under the pool lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct PoolCounters {
    pub max_pages: usize,
    pub grows: u64,
    pub grow_fails: u64,
    pub shrinks: u64,
    pub access: u64,
    pub missings: u64,
    pub lowfree: usize,
    pub max_wqlen: usize,
    pub max_wait: Duration,
    pub outofmem: u64,
}

/// Point-in-time view of the pool, as published to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Physical memory in pool-sized pages.
    pub physical_pages: usize,
    /// Page slots per pool segment.
    pub pages_per_pool: usize,
    /// Capacity in pages.
    pub max_pages: usize,
    /// Capacity in segments.
    pub max_pools: usize,
    /// Pages currently committed.
    pub total_pages: usize,
    /// Committed pages not held by any descriptor.
    pub free_pages: usize,
    /// Weighted idleness, 0..=100.
    pub idle_idx: u64,
    /// Seconds since the last shrink.
    pub last_shrink_secs: u64,
    /// Seconds since the last successful get.
    pub last_access_secs: u64,
    /// Highest `total_pages` ever reached.
    pub max_pages_reached: usize,
    /// Grow attempts.
    pub grows: u64,
    /// Grow attempts rolled back on allocation failure.
    pub grow_fails: u64,
    /// Shrinks that released pages.
    pub shrinks: u64,
    /// `get_pages` calls that reached the pool.
    pub cache_access: u64,
    /// Times a request found too few free pages.
    pub cache_missing: u64,
    /// Lowest free count since the last grow.
    pub low_free_mark: usize,
    /// Deepest wait queue observed.
    pub max_waitqueue_depth: usize,
    /// Longest time a request spent short of pages, in milliseconds.
    pub max_wait_ms: u64,
    /// Requests refused with out-of-memory.
    pub out_of_mem: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "physical pages:          {}", self.physical_pages)?;
        writeln!(f, "pages per pool:          {}", self.pages_per_pool)?;
        writeln!(f, "max pages:               {}", self.max_pages)?;
        writeln!(f, "max pools:               {}", self.max_pools)?;
        writeln!(f, "total pages:             {}", self.total_pages)?;
        writeln!(f, "total free:              {}", self.free_pages)?;
        writeln!(f, "idle index:              {}/100", self.idle_idx)?;
        writeln!(f, "last shrink:             {}s", self.last_shrink_secs)?;
        writeln!(f, "last access:             {}s", self.last_access_secs)?;
        writeln!(f, "max pages reached:       {}", self.max_pages_reached)?;
        writeln!(f, "grows:                   {}", self.grows)?;
        writeln!(f, "grows failure:           {}", self.grow_fails)?;
        writeln!(f, "shrinks:                 {}", self.shrinks)?;
        writeln!(f, "cache access:            {}", self.cache_access)?;
        writeln!(f, "cache missing:           {}", self.cache_missing)?;
        writeln!(f, "low free mark:           {}", self.low_free_mark)?;
        writeln!(f, "max waitqueue depth:     {}", self.max_waitqueue_depth)?;
        writeln!(f, "max wait time:           {}/1000", self.max_wait_ms)?;
        writeln!(f, "out of mem:              {}", self.out_of_mem)
    }
}
