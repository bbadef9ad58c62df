//! Index computes informer bookkeeping from the local Object cache.
//!
//! The reflector store stands in for the field indices a client cache would
//! carry: one lookup maps `(providerConfig, GVK)` to watching Objects, the
//! other maps remote object coordinates back to the Objects to enqueue.

use std::collections::HashSet;
use std::str::FromStr;

use kube::core::{GroupVersion, GroupVersionKind};
use kube::runtime::reflector::Store;

use api::v1alpha1::Object;

/// WatchKey identifies one informer: the ProviderConfig name and the GVK it
/// watches.
pub type WatchKey = (String, GroupVersionKind);

/// Object_gvk is the GVK references default to.
pub fn object_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(api::GROUP, api::v1alpha1::VERSION, "Object")
}

fn reference_gvk(api_version: Option<&str>, kind: Option<&str>) -> Option<GroupVersionKind> {
    let fallback = object_gvk();
    let gv = match api_version {
        Some(v) if !v.is_empty() => GroupVersion::from_str(v).ok()?,
        _ => GroupVersion {
            group: fallback.group,
            version: fallback.version,
        },
    };
    let kind = match kind {
        Some(k) if !k.is_empty() => k,
        _ => "Object",
    };
    Some(gv.with_kind(kind))
}

/// Watching reports whether an Object asks for live watches at all.
pub fn watching(obj: &Object) -> bool {
    obj.spec.watch.unwrap_or(false) && obj.metadata.deletion_timestamp.is_none()
}

/// Keys_for returns the informer keys one Object needs: its manifest's GVK
/// plus the GVK of every reference.
pub fn keys_for(obj: &Object) -> Vec<WatchKey> {
    let pc = obj.spec.provider_config_ref.name.clone();
    let mut out = Vec::new();
    if let Ok(parsed) = crate::manifest::parse(obj) {
        out.push((pc.clone(), parsed.gvk));
    }
    for r in &obj.spec.references {
        if let Some(t) = r.target() {
            if let Some(gvk) = reference_gvk(t.api_version, t.kind) {
                let key = (pc.clone(), gvk);
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        }
    }
    out
}

/// Live_keys computes the informer keys every live, watching Object needs.
pub fn live_keys(store: &Store<Object>) -> HashSet<WatchKey> {
    let mut out = HashSet::new();
    for obj in store.state() {
        if !watching(&obj) {
            continue;
        }
        out.extend(keys_for(&obj));
    }
    out
}

/// Matches_event reports whether a remote event on `(gvk, namespace, name)`
/// via `pc` concerns this Object: either its manifest addresses those
/// coordinates, or one of its references does.
pub fn matches_event(
    obj: &Object,
    pc: &str,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> bool {
    if !watching(obj) || obj.spec.provider_config_ref.name != pc {
        return false;
    }
    if let Ok(parsed) = crate::manifest::parse(obj) {
        if parsed.gvk == *gvk && parsed.name() == name && parsed.namespace() == namespace {
            return true;
        }
    }
    obj.spec.references.iter().any(|r| {
        r.target().is_some_and(|t| {
            reference_gvk(t.api_version, t.kind).is_some_and(|g| g == *gvk)
                && t.name == name
                && t.namespace == namespace
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::{self, ProviderConfigReference, Reference};
    use serde_json::json;

    fn watch_object(name: &str, pc: &str, manifest: serde_json::Value) -> Object {
        let mut o = Object::new(
            name,
            v1alpha1::ObjectSpec {
                provider_config_ref: ProviderConfigReference { name: pc.into() },
                for_provider: v1alpha1::ObjectParameters {
                    manifest: k8s_openapi::apimachinery::pkg::runtime::RawExtension(manifest),
                },
                watch: Some(true),
                ..Default::default()
            },
        );
        o.metadata.uid = Some(format!("uid-{name}"));
        o
    }

    #[test]
    fn keys_include_manifest_and_reference_gvks() {
        let mut o = watch_object(
            "a",
            "remote",
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "foo"}}),
        );
        o.spec.references = vec![Reference {
            depends_on: Some(v1alpha1::DependsOn {
                name: "b".into(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let keys = keys_for(&o);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].1, GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(keys[1].1, object_gvk());
    }

    #[test]
    fn duplicate_reference_gvks_collapse() {
        let mut o = watch_object(
            "a",
            "remote",
            json!({"apiVersion": "v1", "kind": "ConfigMap"}),
        );
        o.spec.references = vec![
            Reference {
                depends_on: Some(v1alpha1::DependsOn {
                    name: "b".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Reference {
                depends_on: Some(v1alpha1::DependsOn {
                    name: "c".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        assert_eq!(keys_for(&o).len(), 2);
    }

    #[test]
    fn event_matching_uses_manifest_coordinates() {
        let o = watch_object(
            "a",
            "remote",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "foo", "namespace": "bar"},
            }),
        );
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        assert!(matches_event(&o, "remote", &gvk, Some("bar"), "foo"));
        assert!(!matches_event(&o, "other", &gvk, Some("bar"), "foo"));
        assert!(!matches_event(&o, "remote", &gvk, Some("bar"), "quux"));
        assert!(!matches_event(&o, "remote", &gvk, None, "foo"));
    }

    #[test]
    fn non_watching_objects_never_match() {
        let mut o = watch_object(
            "a",
            "remote",
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "foo"}}),
        );
        o.spec.watch = None;
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        assert!(!matches_event(&o, "remote", &gvk, None, "foo"));
    }
}
