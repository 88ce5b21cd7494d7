//! Value serialization for migration and journal-restore
//!
//! A dumped value is the bincode encoding of `ValueDump`, carried as the
//! binary payload of `RESTORE key ttl_ms serialized [ABSTTL] [STICK]`.
//! The receiving side rebuilds the container through the normal write
//! path, so encodings are re-chosen locally rather than shipped.

use serde::{Deserialize, Serialize};

use shoal_core::{OpResult, OpStatus};

use crate::db::Db;
use crate::hash::HSetFlags;
use crate::value::{CompactValue, CoreType};
use crate::zset::ZAddFlags;

/// Wire form of one value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueDump {
    String(Vec<u8>),
    /// field, value, optional absolute expiry ms
    Hash(Vec<(Vec<u8>, Vec<u8>, Option<u64>)>),
    ZSet(Vec<(Vec<u8>, f64)>),
    Set(Vec<Vec<u8>>),
    Json(String),
}

/// Serialize a resident value. Offloaded values must be materialized
/// through the tiered storage before dumping.
pub fn dump_value(value: &CompactValue, now_ms: u64) -> OpResult<Vec<u8>> {
    if value.is_external() {
        return Err(OpStatus::KeyNotFound);
    }
    let dump = match value.type_of() {
        CoreType::String => ValueDump::String(value.get_string()),
        CoreType::Hash => {
            ValueDump::Hash(value.as_hash().unwrap().entries_with_ttl(now_ms))
        }
        CoreType::ZSet => ValueDump::ZSet(
            value
                .as_zset()
                .unwrap()
                .entries()
                .into_iter()
                .map(|(m, s)| (m.to_vec(), s))
                .collect(),
        ),
        CoreType::Set => ValueDump::Set(value.as_set().unwrap().members()),
        CoreType::Json => ValueDump::Json(value.as_json().unwrap().to_string()),
        other => {
            return Err(OpStatus::InvalidArgument(format!(
                "cannot serialize value of type {other:?}"
            )))
        }
    };
    bincode::serialize(&dump).map_err(|e| OpStatus::InvalidArgument(e.to_string()))
}

/// Decode a dumped value
pub fn load_value(data: &[u8]) -> OpResult<ValueDump> {
    bincode::deserialize(data).map_err(|e| OpStatus::InvalidArgument(e.to_string()))
}

/// Apply a dump to a keyspace, replacing any existing key
pub fn restore_into(
    db: &mut Db,
    key: &[u8],
    dump: ValueDump,
    expire_at_ms: Option<u64>,
    sticky: bool,
    now_ms: u64,
) -> OpResult<()> {
    db.del(key);
    match dump {
        ValueDump::String(data) => db.set_string(key, &data),
        ValueDump::Hash(entries) => {
            for (field, value, ttl_at) in entries {
                let flags = HSetFlags { skip_if_exists: false, ttl_at };
                db.hset(key, &[(&field, &value)], flags, now_ms)?;
            }
        }
        ValueDump::ZSet(entries) => {
            let pairs: Vec<(f64, &[u8])> =
                entries.iter().map(|(m, s)| (*s, m.as_slice())).collect();
            db.zadd(key, &pairs, ZAddFlags::default(), true, now_ms)?;
        }
        ValueDump::Set(members) => {
            let mut set = crate::set::SetContainer::new();
            for member in &members {
                set.add(member);
            }
            let mut value = CompactValue::new();
            value.init_set(Box::new(set));
            db.table.insert(bytes::Bytes::copy_from_slice(key), value);
        }
        ValueDump::Json(text) => {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| OpStatus::InvalidArgument(e.to_string()))?;
            let mut value = CompactValue::new();
            value.init_json(Box::new(parsed));
            db.table.insert(bytes::Bytes::copy_from_slice(key), value);
        }
    }
    if expire_at_ms.is_some() {
        db.set_key_expire_ms(key, expire_at_ms);
    }
    if sticky {
        if let Some(v) = db.table.find_mut_quiet(key) {
            v.set_sticky(true);
        }
    }
    Ok(())
}
