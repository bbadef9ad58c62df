//! Manifest holds parsing and field-path helpers for embedded manifests.

use std::str::FromStr;

use kube::core::{GroupVersion, GroupVersionKind};
use serde_json::Value;

use crate::{Error, Result};
use api::v1alpha1;

/// Parsed is an embedded manifest validated into an object tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Parsed {
    /// Manifest is the object tree.
    pub manifest: Value,
    /// Gvk identifies the manifest's type.
    pub gvk: GroupVersionKind,
}

impl Parsed {
    /// Name returns the manifest's metadata.name.
    pub fn name(&self) -> &str {
        self.manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Namespace returns the manifest's metadata.namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.manifest
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
    }
}

/// Parse validates the embedded manifest of `obj`.
///
/// `kind` must be present; `metadata.name` defaults to the Object's own name.
pub fn parse(obj: &v1alpha1::Object) -> Result<Parsed> {
    use kube::ResourceExt;
    let mut manifest = obj.spec.for_provider.manifest.0.clone();
    if !manifest.is_object() {
        return Err(Error::Manifest("manifest is not an object".into()));
    }
    let kind = manifest
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if kind.is_empty() {
        return Err(Error::Manifest("manifest has no kind".into()));
    }
    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let gv = GroupVersion::from_str(&api_version)
        .map_err(|err| Error::Manifest(format!("bad apiVersion {api_version:?}: {err}")))?;

    let name = manifest
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if name.is_empty() {
        let name = obj.name_any();
        set_value(&mut manifest, "metadata.name", Value::String(name))
            .map_err(Error::Manifest)?;
    }

    Ok(Parsed {
        gvk: gv.with_kind(&kind),
        manifest,
    })
}

/// Gvk_of reads the GroupVersionKind out of an arbitrary object tree.
pub fn gvk_of(v: &Value) -> Result<GroupVersionKind> {
    let kind = v.get("kind").and_then(Value::as_str).unwrap_or_default();
    if kind.is_empty() {
        return Err(Error::Manifest("object has no kind".into()));
    }
    let api_version = v
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let gv = GroupVersion::from_str(api_version)
        .map_err(|err| Error::Manifest(format!("bad apiVersion {api_version:?}: {err}")))?;
    Ok(gv.with_kind(kind))
}

/// Segment is one step of a field path.
#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse_path splits a dotted field path into segments.
///
/// Supported syntax: `a.b`, `a[3].b`, `a['key.with.dots']`.
fn parse_path(path: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut out = Vec::new();
    let mut chars = path.chars().peekable();
    let mut cur = String::new();
    let flush = |cur: &mut String, out: &mut Vec<Segment>| {
        if !cur.is_empty() {
            out.push(Segment::Key(std::mem::take(cur)));
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut cur, &mut out),
            '[' => {
                flush(&mut cur, &mut out);
                match chars.peek() {
                    Some('\'') | Some('"') => {
                        let quote = chars.next().unwrap_or('\'');
                        let mut key = String::new();
                        loop {
                            match chars.next() {
                                Some(c) if c == quote => break,
                                Some(c) => key.push(c),
                                None => {
                                    return Err(format!("unterminated quote in path {path:?}"))
                                }
                            }
                        }
                        if chars.next() != Some(']') {
                            return Err(format!("missing ']' in path {path:?}"));
                        }
                        out.push(Segment::Key(key));
                    }
                    _ => {
                        let mut digits = String::new();
                        loop {
                            match chars.next() {
                                Some(']') => break,
                                Some(c) if c.is_ascii_digit() => digits.push(c),
                                Some(c) => {
                                    return Err(format!("bad index char {c:?} in path {path:?}"))
                                }
                                None => return Err(format!("missing ']' in path {path:?}")),
                            }
                        }
                        let n = digits
                            .parse::<usize>()
                            .map_err(|err| format!("bad index in path {path:?}: {err}"))?;
                        out.push(Segment::Index(n));
                    }
                }
                // Swallow the dot after a bracket, if present.
                if chars.peek() == Some(&'.') {
                    chars.next();
                }
            }
            _ => cur.push(c),
        }
    }
    flush(&mut cur, &mut out);
    if out.is_empty() {
        return Err("empty field path".into());
    }
    Ok(out)
}

/// Get_value reads the value at `path`, or None when any step is missing.
pub fn get_value<'a>(
    root: &'a Value,
    path: &str,
) -> std::result::Result<Option<&'a Value>, String> {
    let mut cur = root;
    for seg in parse_path(path)? {
        cur = match (seg, cur) {
            (Segment::Key(k), Value::Object(m)) => match m.get(&k) {
                Some(v) => v,
                None => return Ok(None),
            },
            (Segment::Index(i), Value::Array(a)) => match a.get(i) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(cur))
}

/// Set_value writes `v` at `path`, creating intermediate maps and extending
/// arrays as needed.
pub fn set_value(root: &mut Value, path: &str, v: Value) -> std::result::Result<(), String> {
    let segs = parse_path(path)?;
    let mut cur = root;
    for (i, seg) in segs.iter().enumerate() {
        let last = i + 1 == segs.len();
        match seg {
            Segment::Key(k) => {
                if !cur.is_object() {
                    *cur = Value::Object(Default::default());
                }
                let m = cur.as_object_mut().expect("just made an object");
                if last {
                    m.insert(k.clone(), v);
                    return Ok(());
                }
                cur = m.entry(k.clone()).or_insert(Value::Null);
            }
            Segment::Index(n) => {
                if !cur.is_array() {
                    *cur = Value::Array(Default::default());
                }
                let a = cur.as_array_mut().expect("just made an array");
                while a.len() <= *n {
                    a.push(Value::Null);
                }
                if last {
                    a[*n] = v;
                    return Ok(());
                }
                cur = &mut a[*n];
            }
        }
    }
    unreachable!("parse_path returned at least one segment")
}
