pub mod alloc;
pub mod ascii;
pub mod db;
pub mod geo;
pub mod hash;
pub mod listpack;
pub mod num;
pub mod pattern;
pub mod sbf;
pub mod serialize;
pub mod set;
pub mod setops;
pub mod shard;
pub mod stringmap;
pub mod table;
pub mod value;
pub mod zset;

// Re-export shoal-core routing types for convenience
pub use shoal_core::{slot_for_key, DbIndex, ShardId, SlotId, SlotSet, TOTAL_SLOTS};

// Re-export commonly used types
pub use db::{
    CombineOp, Db, DbLimits, ExpireTable, GeoCenter, GeoReplyItem, GeoReplyOpts,
    GeoSearchOutcome, GeoStoreTarget, StringFetch,
};
pub use serialize::{dump_value, load_value, restore_into, ValueDump};
pub use shard::{ShardSet, ShardState, ShardStats};
pub use table::{Bucket, ChangeCallback, PrimeTable};
pub use value::{CompactValue, CoreType, DiskSegment, ObjType, PAGE_SIZE};
