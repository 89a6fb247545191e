//! Reconciliation of a category store against the devices reported by hosts.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::Result;
use crate::hardware::{HardwareCategory, HardwareItem};
use crate::store::CategoryStore;
use crate::types::{HostSnapshot, Params};

/// What one reconciliation pass did to a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// New keys with their global insertion index
    pub added: Vec<(String, usize)>,
    /// Keys removed because no host reports them anymore
    pub removed: Vec<String>,
    /// Generate placeholders that received a host-assigned key (old, new)
    pub bound: Vec<(String, String)>,
    /// Keys whose values were refreshed from the hosts
    pub updated: Vec<String>,
}

impl ReconcileOutcome {
    /// True when items were added, removed or re-keyed.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.bound.is_empty()
    }
}

/// Merge the devices of one category reported by several hosts.
///
/// Hosts are visited in the given order; for every field the first host
/// reporting a non-empty value wins. Hosts where the domain is not defined
/// or that returned no snapshot contribute nothing.
pub fn merge_external<'a, I>(category: HardwareCategory, snapshots: I) -> BTreeMap<String, Params>
where
    I: IntoIterator<Item = Option<&'a HostSnapshot>>,
{
    let mut merged: BTreeMap<String, Params> = BTreeMap::new();
    for snapshot in snapshots.into_iter().flatten() {
        if !snapshot.defined {
            continue;
        }
        let Some(devices) = snapshot.devices_of(category) else {
            continue;
        };
        for (key, params) in devices {
            let entry = merged.entry(key.clone()).or_default();
            for (name, value) in params {
                if value.is_empty() {
                    continue;
                }
                entry.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    merged
}

/// Bring a store in line with the external key set.
///
/// `offset` is the number of items held by the categories that precede this
/// one; added items report `offset + position inside the category`.
pub fn reconcile(
    store: &CategoryStore,
    external: &BTreeMap<String, Params>,
    offset: usize,
) -> Result<ReconcileOutcome> {
    let category = store.category();
    let mut inner = store.lock()?;
    let mut outcome = ReconcileOutcome::default();

    // Placeholders survive regardless of what the hosts report.
    let stale: Vec<String> = inner
        .ordered()
        .filter(|item| !item.is_new && !item.generate && !external.contains_key(&item.key))
        .map(|item| item.key.clone())
        .collect();
    for key in stale {
        inner.items.remove(&key);
        inner.order.retain(|k| *k != key);
        outcome.removed.push(key);
    }

    for (key, params) in external {
        if let Some(item) = inner.items.get_mut(key) {
            // An unapplied placeholder keeps the values the user gave it.
            if !item.is_new && item.update_from_external(params) {
                outcome.updated.push(key.clone());
            }
            continue;
        }

        // An applied generate placeholder takes the next unseen key in place.
        let waiting = inner
            .ordered()
            .find(|item| item.generate && !item.is_new)
            .map(|item| item.key.clone());
        if let Some(old_key) = waiting {
            if let Some(mut item) = inner.items.remove(&old_key) {
                item.bind(key.clone());
                item.update_from_external(params);
                if let Some(slot) = inner.order.iter_mut().find(|k| **k == old_key) {
                    *slot = key.clone();
                }
                inner.items.insert(key.clone(), item);
                debug!(category = %category, old_key = %old_key, key = %key, "Placeholder bound");
                outcome.bound.push((old_key, key.clone()));
                continue;
            }
        }

        let index = inner.insertion_index(key);
        inner.order.insert(index, key.clone());
        inner
            .items
            .insert(key.clone(), HardwareItem::observed(category, key.clone(), params.clone()));
        outcome.added.push((key.clone(), offset + index));
    }

    inner.rebuild_display_index();

    if outcome.changed() {
        info!(
            category = %category,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            bound = outcome.bound.len(),
            "Hardware reconciled"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn keys(names: &[&str]) -> BTreeMap<String, Params> {
        names
            .iter()
            .map(|n| {
                let source = format!("/images/{}.qcow2", n);
                (n.to_string(), p(&[("source", source.as_str())]))
            })
            .collect()
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        let external = keys(&["vda", "vdb"]);

        let first = reconcile(&store, &external, 0).unwrap();
        assert!(first.changed());
        assert_eq!(first.added.len(), 2);

        let second = reconcile(&store, &external, 0).unwrap();
        assert!(!second.changed());
        assert!(second.updated.is_empty());
    }

    #[test]
    fn test_field_update_is_not_structural() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        reconcile(&store, &keys(&["vda"]), 0).unwrap();

        let mut external = keys(&["vda"]);
        external.get_mut("vda").unwrap().insert("source".into(), "/images/moved.qcow2".into());
        let outcome = reconcile(&store, &external, 0).unwrap();
        assert!(!outcome.changed());
        assert_eq!(outcome.updated, vec!["vda".to_string()]);
    }

    #[test]
    fn test_sorted_insert_and_offset() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        reconcile(&store, &keys(&["vda", "vdc"]), 0).unwrap();

        let outcome = reconcile(&store, &keys(&["vda", "vdb", "vdc"]), 3).unwrap();
        assert_eq!(outcome.added, vec![("vdb".to_string(), 4)]);
        assert_eq!(store.keys().unwrap(), vec!["vda", "vdb", "vdc"]);
    }

    #[test]
    fn test_numeric_keys_sort_numerically() {
        let store = CategoryStore::new(HardwareCategory::Serial);
        let external: BTreeMap<String, Params> = ["0", "2", "10"]
            .iter()
            .map(|k| (k.to_string(), p(&[("type", "pty")])))
            .collect();
        reconcile(&store, &external, 0).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["0", "2", "10"]);
    }

    #[test]
    fn test_placeholders_survive_empty_snapshot() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        reconcile(&store, &keys(&["vda"]), 0).unwrap();
        store
            .add_placeholder(p(&[("target_dev", "vdz"), ("source", "/images/new.qcow2")]))
            .unwrap();

        let outcome = reconcile(&store, &BTreeMap::new(), 0).unwrap();
        assert_eq!(outcome.removed, vec!["vda".to_string()]);
        assert_eq!(store.keys().unwrap(), vec!["vdz"]);
    }

    #[test]
    fn test_new_keys_go_before_placeholders() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        store
            .add_placeholder(p(&[("target_dev", "vda"), ("source", "/images/new.qcow2")]))
            .unwrap();
        reconcile(&store, &keys(&["vdb"]), 0).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["vdb", "vda"]);
    }

    #[test]
    fn test_reported_key_does_not_overwrite_placeholder() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        store
            .add_placeholder(p(&[("target_dev", "vda"), ("source", "/images/mine.qcow2")]))
            .unwrap();

        let outcome = reconcile(&store, &keys(&["vda"]), 0).unwrap();
        assert!(outcome.updated.is_empty());
        assert!(!outcome.changed());

        let item = store.get("vda").unwrap().unwrap();
        assert!(item.is_new);
        assert_eq!(item.param("source"), Some("/images/mine.qcow2"));
    }

    #[test]
    fn test_generate_placeholder_is_bound_in_place() {
        let store = CategoryStore::new(HardwareCategory::Interface);
        let nic = |source: &str| p(&[("type", "network"), ("source", source)]);
        let mut external = BTreeMap::new();
        external.insert("52:54:00:00:00:01".to_string(), nic("default"));
        reconcile(&store, &external, 0).unwrap();

        let placeholder = store
            .add_placeholder(p(&[("type", "network"), ("source", "lan"), ("mac", "generate")]))
            .unwrap();
        // Not applied yet: an unrelated new key must not take it over.
        external.insert("52:54:00:00:00:00".to_string(), nic("default"));
        let outcome = reconcile(&store, &external, 0).unwrap();
        assert!(outcome.bound.is_empty());
        assert_eq!(store.len().unwrap(), 3);

        store.mark_applied(&store.items().unwrap()).unwrap();
        external.insert("52:54:00:00:00:ff".to_string(), nic("lan"));
        let outcome = reconcile(&store, &external, 0).unwrap();
        assert!(outcome.changed());
        assert_eq!(
            outcome.bound,
            vec![(placeholder, "52:54:00:00:00:ff".to_string())]
        );
        assert_eq!(
            store.keys().unwrap(),
            vec!["52:54:00:00:00:00", "52:54:00:00:00:01", "52:54:00:00:00:ff"]
        );
    }

    #[test]
    fn test_merge_first_writer_wins_per_field() {
        let h1 = HostSnapshot::defined().with_device(
            HardwareCategory::Disk,
            "vda",
            p(&[("source", "/h1/a.qcow2"), ("cache", "")]),
        );
        let h2 = HostSnapshot::defined().with_device(
            HardwareCategory::Disk,
            "vda",
            p(&[("source", "/h2/a.qcow2"), ("cache", "none")]),
        );
        let undefined =
            HostSnapshot::default().with_device(HardwareCategory::Disk, "vdq", Params::new());

        let merged = merge_external(
            HardwareCategory::Disk,
            vec![None, Some(&undefined), Some(&h1), Some(&h2)],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["vda"]["source"], "/h1/a.qcow2");
        assert_eq!(merged["vda"]["cache"], "none");
    }
}
