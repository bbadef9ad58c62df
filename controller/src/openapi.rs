//! Openapi builds and caches typed-field parsers from remote `/openapi/v3`
//! discovery documents.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use kube::core::{GroupVersion, GroupVersionKind};
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::{Error, Result};

/// DISCOVERY_PATH is the OpenAPI v3 discovery endpoint.
const DISCOVERY_PATH: &str = "/openapi/v3";

/// ParserManager owns one parser cache per ProviderConfig.
#[derive(Default)]
pub struct ParserManager {
    caches: RwLock<HashMap<String, Arc<ParserCache>>>,
}

impl ParserManager {
    /// Cache_for returns the cache for the ProviderConfig with the given UID.
    pub fn cache_for(&self, uid: &str) -> Arc<ParserCache> {
        if let Some(c) = self.caches.read().expect("lock poisoned").get(uid) {
            return c.clone();
        }
        let mut w = self.caches.write().expect("lock poisoned");
        w.entry(uid.to_string()).or_default().clone()
    }

    /// Remove drops the cache for a deleted ProviderConfig.
    pub fn remove(&self, uid: &str) {
        self.caches.write().expect("lock poisoned").remove(uid);
    }
}

/// ParserCache maps GroupVersion to an ETag-keyed parser for one remote
/// cluster.
#[derive(Default)]
pub struct ParserCache {
    entries: RwLock<HashMap<String, (Arc<GvkParser>, String)>>,
    // One async lock per GroupVersion; concurrent builds of the same GV wait
    // on the first.
    building: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// DiscoveredPath is one entry of the discovery document.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredPath {
    /// Url is the server-relative URL of the GroupVersion document.
    pub url: String,
    /// Etag is the hash query parameter of that URL, empty when absent.
    pub etag: String,
}

/// Parse_discovery extracts `path → (url, etag)` from a discovery document.
pub fn parse_discovery(doc: &Value) -> Result<HashMap<String, DiscoveredPath>> {
    let paths = doc
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Config("discovery document has no paths".into()))?;
    let mut out = HashMap::new();
    for (path, entry) in paths {
        let url = entry
            .get("serverRelativeURL")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let etag = url
            .split_once("hash=")
            .map(|(_, h)| h.split('&').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        out.insert(path.clone(), DiscoveredPath { url, etag });
    }
    Ok(out)
}

/// Gv_path is the discovery key for a GroupVersion.
pub fn gv_path(gv: &GroupVersion) -> String {
    if gv.group.is_empty() {
        format!("api/{}", gv.version)
    } else {
        format!("apis/{}/{}", gv.group, gv.version)
    }
}

impl ParserCache {
    /// Evict_stale drops cached GroupVersions whose discovery path is gone or
    /// whose ETag changed.
    fn evict_stale(&self, discovered: &HashMap<String, DiscoveredPath>) {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.retain(|path, (_, etag)| {
            discovered
                .get(path)
                .is_some_and(|d| !d.etag.is_empty() && d.etag == *etag)
        });
    }

    fn lookup(&self, path: &str) -> Option<Arc<GvkParser>> {
        self.entries
            .read()
            .expect("lock poisoned")
            .get(path)
            .map(|(p, _)| p.clone())
    }

    fn build_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.building
            .lock()
            .expect("lock poisoned")
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Parser_for returns the typed-field parser for a GroupVersion on the
    /// remote cluster, fetching and building it when the cached copy is
    /// missing or stale.
    #[instrument(skip(self, client), fields(gv = gv.api_version()))]
    pub async fn parser_for(
        &self,
        client: &kube::Client,
        gv: &GroupVersion,
    ) -> Result<Arc<GvkParser>> {
        let doc: Value = client
            .request(
                http::Request::get(DISCOVERY_PATH)
                    .body(Vec::new())
                    .expect("static request"),
            )
            .await
            .map_err(Error::RemoteApi)?;
        let discovered = parse_discovery(&doc)?;
        self.evict_stale(&discovered);

        let path = gv_path(gv);
        if let Some(p) = self.lookup(&path) {
            trace!("parser cache hit");
            return Ok(p);
        }
        let entry = discovered
            .get(&path)
            .ok_or_else(|| {
                Error::Config(format!("no OpenAPI document for {}", gv.api_version()))
            })?
            .clone();

        let lock = self.build_lock(&path);
        let _guard = lock.lock().await;
        // A concurrent build may have won the race while we waited.
        if let Some(p) = self.lookup(&path) {
            trace!("parser built concurrently");
            return Ok(p);
        }

        debug!(url = entry.url, "fetching GroupVersion schema");
        let schema: Value = client
            .request(
                http::Request::get(entry.url.as_str())
                    .body(Vec::new())
                    .map_err(|err| Error::Config(format!("bad schema url: {err}")))?,
            )
            .await
            .map_err(Error::RemoteApi)?;
        let parser = Arc::new(GvkParser::new(&schema)?);
        if !entry.etag.is_empty() {
            self.entries
                .write()
                .expect("lock poisoned")
                .insert(path, (parser.clone(), entry.etag));
        }
        Ok(parser)
    }
}

/// GvkParser indexes the schemas of one GroupVersion document and validates
/// their references.
#[derive(Debug)]
pub struct GvkParser {
    schemas: HashMap<String, Value>,
    by_gvk: HashMap<GroupVersionKind, String>,
}

const LOCAL_REF_PREFIX: &str = "#/components/schemas/";

impl GvkParser {
    /// New builds a parser from an OpenAPI v3 GroupVersion document.
    ///
    /// Every `$ref` must be a local `#/components/schemas/<name>` that exists
    /// in the same document; violations are aggregated into one error.
    pub fn new(doc: &Value) -> Result<GvkParser> {
        let schemas = doc
            .pointer("/components/schemas")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Config("schema document has no components.schemas".into()))?;

        let mut bad = Vec::new();
        for (name, schema) in schemas {
            check_refs(schema, schemas, name, &mut bad);
        }
        if !bad.is_empty() {
            bad.sort();
            return Err(Error::Config(format!(
                "invalid schema references: {}",
                bad.join("; ")
            )));
        }

        let mut by_gvk = HashMap::new();
        for (name, schema) in schemas {
            let gvks = schema
                .get("x-kubernetes-group-version-kind")
                .and_then(Value::as_array);
            for g in gvks.into_iter().flatten() {
                let (group, version, kind) = (
                    g.get("group").and_then(Value::as_str).unwrap_or_default(),
                    g.get("version").and_then(Value::as_str).unwrap_or_default(),
                    g.get("kind").and_then(Value::as_str).unwrap_or_default(),
                );
                if kind.is_empty() || version.is_empty() {
                    continue;
                }
                by_gvk.insert(
                    GroupVersionKind::gvk(group, version, kind),
                    name.clone(),
                );
            }
        }

        Ok(GvkParser {
            schemas: schemas
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            by_gvk,
        })
    }

    /// Type_for returns the schema for a GroupVersionKind, if the document
    /// declares it.
    pub fn type_for(&self, gvk: &GroupVersionKind) -> Option<&Value> {
        self.by_gvk.get(gvk).and_then(|name| self.schemas.get(name))
    }
}

fn check_refs(
    v: &Value,
    schemas: &serde_json::Map<String, Value>,
    at: &str,
    bad: &mut Vec<String>,
) {
    match v {
        Value::Object(m) => {
            if let Some(r) = m.get("$ref").and_then(Value::as_str) {
                match r.strip_prefix(LOCAL_REF_PREFIX) {
                    Some(name) if schemas.contains_key(name) => {}
                    Some(name) => bad.push(format!("{at}: unknown schema {name:?}")),
                    None => bad.push(format!("{at}: non-local reference {r:?}")),
                }
            }
            for child in m.values() {
                check_refs(child, schemas, at, bad);
            }
        }
        Value::Array(a) => {
            for child in a {
                check_refs(child, schemas, at, bad);
            }
        }
        _ => {}
    }
}
