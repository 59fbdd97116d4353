//! Core crate exports for Tidemark.
//!
//! Tidemark layers multi-version concurrency control over a partitioned
//! key-value substrate: versions and read markers live next to the data,
//! conflicts are detected on the write path, and commit or rollback sweeps
//! every partition a transaction touched.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fanout;
pub mod mvcc;
pub mod node;
pub mod processor;
pub mod substrate;
pub mod transaction;
pub mod types;
pub mod wait;

pub use cache::{InvokeResult, MvccCache};
pub use config::{ClusterConfig, ConfigError, FanOutConfig, TidemarkConfig, TransactionConfig};
pub use error::{MvccError, Result};
pub use node::TidemarkNode;
pub use processor::{
    EntryFilter, EntryProcessor, Processing, ProcessorError, Reducer, ResolvedEntry,
};
pub use substrate::{LocalCluster, Substrate, SubstrateError};
pub use transaction::{
    Transaction, TransactionError, TransactionManager, TransactionMetadata, TransactionState,
};
pub use types::{
    CacheName, IsolationLevel, Key, NodeId, PartitionId, PartitionSet, TransactionId, Value,
    VersionedKey,
};
pub use wait::WaitOutcome;
