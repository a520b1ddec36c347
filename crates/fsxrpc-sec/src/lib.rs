#![warn(missing_docs)]

//! fsxrpc bulk security subsystem.
//!
//! A shared, self-sizing pool of fixed-size pages used to stage encrypted or
//! checksummed bulk RPC data, plus the checksum and security descriptor
//! codecs applied to those bulks.

pub mod bulk;
pub mod config;
pub mod error;
pub mod hash;
pub mod page;
pub mod pool;
pub mod sec_desc;
pub mod shrink;
pub mod stats;

pub use bulk::{BulkDesc, BulkFragment};
pub use config::PoolConfig;
pub use error::{ConfigError, PoolError, SecError, SecResult};
pub use hash::{compute_bulk_checksum, BulkHashAlg};
pub use page::{HeapPageAllocator, Page, PageAllocator};
pub use pool::{CallerRole, EncPagePool};
pub use sec_desc::{BulkSecDesc, BulkSvc, BulkType};
pub use shrink::Shrinker;
pub use stats::PoolStats;
