//! Managed_fields projects the subtree of a remote object owned by one field
//! manager, per its FieldsV1 managed-field entry.

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Extract returns the subtree of `remote` owned by `manager` via a
/// server-side apply, or None when the manager owns nothing.
///
/// `apiVersion`, `kind` and the object identity are always carried over so
/// the result is a comparable object.
pub fn extract(remote: &Value, manager: &str) -> Result<Option<Value>> {
    let entries = match remote.pointer("/metadata/managedFields") {
        Some(Value::Array(a)) => a,
        _ => return Ok(None),
    };
    let entry = entries.iter().find(|e| {
        e.get("manager").and_then(Value::as_str) == Some(manager)
            && e.get("operation").and_then(Value::as_str) == Some("Apply")
    });
    let entry = match entry {
        Some(e) => e,
        None => return Ok(None),
    };
    if entry.get("fieldsType").and_then(Value::as_str) != Some("FieldsV1") {
        return Err(Error::Manifest(format!(
            "unsupported managed-fields type for manager {manager:?}"
        )));
    }
    let set = entry
        .get("fieldsV1")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Manifest("managed-fields entry has no fieldsV1".into()))?;

    let mut out = match project(remote, set).map_err(Error::Manifest)? {
        Some(Value::Object(m)) => m,
        Some(_) | None => Map::new(),
    };
    for k in ["apiVersion", "kind"] {
        if let Some(v) = remote.get(k) {
            out.insert(k.to_string(), v.clone());
        }
    }
    let mut meta = out
        .remove("metadata")
        .and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default();
    for k in ["name", "namespace"] {
        if let Some(v) = remote.pointer(&format!("/metadata/{k}")) {
            meta.insert(k.to_string(), v.clone());
        }
    }
    out.insert("metadata".to_string(), Value::Object(meta));
    Ok(Some(Value::Object(out)))
}

/// Project walks one FieldsV1 level against the matching value level.
///
/// An empty set means the whole value is owned. Object levels use `f:` keys,
/// list levels use `k:`/`v:`/`i:` keys, and `.` marks ownership of the level
/// itself.
fn project(value: &Value, set: &Map<String, Value>) -> std::result::Result<Option<Value>, String> {
    if set.is_empty() {
        return Ok(Some(value.clone()));
    }

    let mut own_self = false;
    let mut fields: Map<String, Value> = Map::new();
    let mut items: Vec<Value> = Vec::new();
    let mut saw_field = false;
    let mut saw_item = false;

    for (key, sub) in set {
        let subset = sub
            .as_object()
            .ok_or_else(|| format!("malformed fieldsV1 at {key:?}"))?;
        if key.as_str() == "." {
            own_self = true;
            continue;
        }
        if let Some(name) = key.strip_prefix("f:") {
            saw_field = true;
            if let Some(child) = value.get(name) {
                if let Some(v) = project(child, subset)? {
                    fields.insert(name.to_string(), v);
                }
            }
            continue;
        }
        if let Some(raw) = key.strip_prefix("k:") {
            saw_item = true;
            let keyfields: Value =
                serde_json::from_str(raw).map_err(|err| format!("bad list key {raw:?}: {err}"))?;
            let keyfields = keyfields
                .as_object()
                .ok_or_else(|| format!("list key {raw:?} is not an object"))?;
            if let Some(arr) = value.as_array() {
                let found = arr.iter().find(|e| {
                    keyfields
                        .iter()
                        .all(|(k, want)| e.get(k) == Some(want))
                });
                if let Some(e) = found {
                    if let Some(v) = project(e, subset)? {
                        items.push(v);
                    }
                }
            }
            continue;
        }
        if let Some(raw) = key.strip_prefix("v:") {
            saw_item = true;
            let want: Value =
                serde_json::from_str(raw).map_err(|err| format!("bad set value {raw:?}: {err}"))?;
            if let Some(arr) = value.as_array() {
                if arr.contains(&want) {
                    items.push(want);
                }
            }
            continue;
        }
        if let Some(raw) = key.strip_prefix("i:") {
            saw_item = true;
            let idx = raw
                .parse::<usize>()
                .map_err(|err| format!("bad list index {raw:?}: {err}"))?;
            if let Some(e) = value.as_array().and_then(|a| a.get(idx)) {
                if let Some(v) = project(e, subset)? {
                    items.push(v);
                }
            }
            continue;
        }
        return Err(format!("unknown fieldsV1 key {key:?}"));
    }

    if saw_item {
        if items.is_empty() && !own_self {
            return Ok(None);
        }
        return Ok(Some(Value::Array(items)));
    }
    if saw_field {
        if fields.is_empty() && !own_self {
            return Ok(None);
        }
        return Ok(Some(Value::Object(fields)));
    }
    // Only ".": the level itself is owned.
    if own_self {
        return Ok(Some(match value {
            Value::Object(_) => Value::Object(Map::new()),
            v => v.clone(),
        }));
    }
    Ok(None)
}
