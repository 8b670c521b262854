//! Purpose: JSON envelopes for database status and records in CLI output.
//! Exports: `db_info_json` and `record_json`.
//! Role: Keep output shape consistent across commands.
//! Invariants: Stable key names; keys and values render as lossy UTF-8 text.

use cabinet::api::{Record, Status};
use serde_json::{Map, Value, json};

pub(crate) fn db_info_json(db_ref: &str, status: &Status) -> Value {
    let mut map = Map::new();
    map.insert("name".to_string(), json!(db_ref));
    map.insert("path".to_string(), json!(status.path.display().to_string()));
    map.insert("mode".to_string(), json!(status.mode.to_string()));
    map.insert("count".to_string(), json!(status.count));
    map.insert("size".to_string(), json!(status.size));
    Value::Object(map)
}

pub(crate) fn record_json(record: &Record) -> Value {
    json!({
        "key": record.key.to_str_lossy(),
        "value": record.value.to_str_lossy(),
    })
}
