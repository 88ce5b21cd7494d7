//! Core abstractions shared by the storage, tiering and journal layers.
//!
//! - `slots`: CRC16 slot routing compatible with Redis Cluster
//! - `error`: typed operation statuses with the user-visible error literals
//! - `config`: process configuration knobs
//! - `context`: cancellation + first-error context for background tasks

pub mod config;
pub mod context;
pub mod error;
pub mod slots;

pub use config::{Config, TieringConfig};
pub use context::RunContext;
pub use error::{OpResult, OpStatus};
pub use slots::{slot_for_key, SlotId, SlotSet, TOTAL_SLOTS};

/// Shard ID type (0-based index into the shard set)
pub type ShardId = u32;

/// Database index. Multiple logical databases share one shard set.
pub type DbIndex = u16;
