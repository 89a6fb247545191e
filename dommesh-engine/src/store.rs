//! Per-category keyed collection of local hardware items.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{DomainError, Result};
use crate::hardware::{HardwareCategory, HardwareItem, GENERATE};
use crate::types::Params;

/// Local hardware items of one category, guarded by one lock.
///
/// Items keep an explicit position inside the category. The display index is
/// advisory and rebuilt on every reconciliation pass.
#[derive(Debug)]
pub struct CategoryStore {
    category: HardwareCategory,
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
pub(crate) struct StoreInner {
    pub(crate) items: HashMap<String, HardwareItem>,
    pub(crate) order: Vec<String>,
    pub(crate) display_index: HashMap<String, String>,
    next_placeholder: u32,
}

impl CategoryStore {
    /// Create an empty store.
    pub fn new(category: HardwareCategory) -> Self {
        Self {
            category,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Category held by this store.
    pub fn category(&self) -> HardwareCategory {
        self.category
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| DomainError::poisoned(self.category.name()))
    }

    /// Number of items, placeholders included.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.order.len())
    }

    /// True when the store holds no item.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys in positional order.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.order.clone())
    }

    /// Items in positional order.
    pub fn items(&self) -> Result<Vec<HardwareItem>> {
        let inner = self.lock()?;
        Ok(inner.ordered().cloned().collect())
    }

    /// Copy of one item.
    pub fn get(&self, key: &str) -> Result<Option<HardwareItem>> {
        Ok(self.lock()?.items.get(key).cloned())
    }

    /// Resolve a display string to the item it currently names.
    pub fn lookup_display(&self, display: &str) -> Result<Option<HardwareItem>> {
        let inner = self.lock()?;
        Ok(inner
            .display_index
            .get(display)
            .and_then(|key| inner.items.get(key))
            .cloned())
    }

    /// Add a user-created placeholder after the last item of the category.
    ///
    /// The key is taken from the category's key parameter. When that value is
    /// missing or `generate`, a local key is assigned and the item waits for
    /// the host to report its real key; only one such item may exist.
    pub fn add_placeholder(&self, params: Params) -> Result<String> {
        let descriptor = self.category.descriptor();
        let mut inner = self.lock()?;

        let key_value = params
            .get(descriptor.key_param)
            .filter(|v| !v.is_empty() && v.as_str() != GENERATE)
            .cloned();

        let (key, generate) = match key_value {
            Some(key) => {
                if inner.items.contains_key(&key) {
                    return Err(DomainError::InvalidState(format!(
                        "{} {} already exists",
                        descriptor.name, key
                    )));
                }
                (key, false)
            }
            None => {
                if descriptor.generate_param.is_none() {
                    return Err(DomainError::InvalidParameter(format!(
                        "{} requires '{}'",
                        descriptor.name, descriptor.key_param
                    )));
                }
                if inner.items.values().any(|item| item.generate) {
                    return Err(DomainError::InvalidState(format!(
                        "a {} waiting for a generated key already exists",
                        descriptor.name
                    )));
                }
                inner.next_placeholder += 1;
                (format!("new-{}-{}", descriptor.name, inner.next_placeholder), true)
            }
        };

        let item = HardwareItem::placeholder(self.category, key.clone(), params, generate);
        item.validate()?;
        inner.items.insert(key.clone(), item);
        inner.order.push(key.clone());
        inner.rebuild_display_index();

        debug!(category = %self.category, key = %key, generate, "Placeholder added");
        Ok(key)
    }

    /// Edit a live parameter of an item.
    pub fn set_param(&self, key: &str, name: &str, value: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let item = inner
            .items
            .get_mut(key)
            .ok_or_else(|| DomainError::DeviceNotFound(format!("{} {}", self.category, key)))?;
        item.set_param(name, value);
        inner.rebuild_display_index();
        Ok(())
    }

    /// Remove an item and return it.
    pub fn remove(&self, key: &str) -> Result<HardwareItem> {
        let mut inner = self.lock()?;
        let item = inner
            .items
            .remove(key)
            .ok_or_else(|| DomainError::DeviceNotFound(format!("{} {}", self.category, key)))?;
        inner.order.retain(|k| k != key);
        inner.rebuild_display_index();
        Ok(item)
    }

    /// Items that must be written on the next apply.
    pub fn changed_items(&self) -> Result<Vec<HardwareItem>> {
        let inner = self.lock()?;
        Ok(inner.ordered().filter(|item| item.is_changed()).cloned().collect())
    }

    /// Record the given copies as applied. Items added or removed since the
    /// copies were taken are left alone. Returns how many items were marked.
    pub fn mark_applied(&self, applied: &[HardwareItem]) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut marked = 0;
        for sent in applied.iter().filter(|item| item.category == self.category) {
            if let Some(item) = inner.items.get_mut(&sent.key) {
                item.mark_applied(sent);
                marked += 1;
            }
        }
        Ok(marked)
    }
}

impl StoreInner {
    pub(crate) fn ordered(&self) -> impl Iterator<Item = &HardwareItem> {
        self.order.iter().filter_map(|key| self.items.get(key))
    }

    /// Position a newly observed key takes inside the category: before the
    /// first placeholder or the first sibling with a greater key.
    pub(crate) fn insertion_index(&self, key: &str) -> usize {
        self.ordered()
            .position(|item| {
                item.is_new || item.generate || compare_keys(&item.key, key) == Ordering::Greater
            })
            .unwrap_or(self.order.len())
    }

    pub(crate) fn rebuild_display_index(&mut self) {
        let index: HashMap<String, String> = self
            .ordered()
            .map(|item| (item.display(), item.key.clone()))
            .collect();
        self.display_index = index;
    }
}

/// Order keys numerically when both are numbers, lexically otherwise.
pub(crate) fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(target: &str, source: &str) -> Params {
        let mut p = Params::new();
        p.insert("target_dev".into(), target.into());
        p.insert("source".into(), source.into());
        p
    }

    #[test]
    fn test_add_placeholder_uses_key_param() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        let key = store.add_placeholder(disk("vdb", "/images/b.qcow2")).unwrap();
        assert_eq!(key, "vdb");

        let item = store.get("vdb").unwrap().unwrap();
        assert!(item.is_new);
        assert!(!item.generate);

        let dup = store.add_placeholder(disk("vdb", "/images/c.qcow2"));
        assert!(matches!(dup, Err(DomainError::InvalidState(_))));
    }

    #[test]
    fn test_only_one_generate_placeholder() {
        let store = CategoryStore::new(HardwareCategory::Interface);
        let first = store
            .add_placeholder((HardwareCategory::Interface.descriptor().defaults)())
            .unwrap();
        assert!(first.starts_with("new-interface-"));

        let second = store.add_placeholder((HardwareCategory::Interface.descriptor().defaults)());
        assert!(matches!(second, Err(DomainError::InvalidState(_))));
    }

    #[test]
    fn test_filesystem_needs_explicit_key() {
        let store = CategoryStore::new(HardwareCategory::Filesystem);
        let result = store.add_placeholder((HardwareCategory::Filesystem.descriptor().defaults)());
        assert!(matches!(result, Err(DomainError::InvalidParameter(_))));
    }

    #[test]
    fn test_display_lookup_follows_edits() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        store.add_placeholder(disk("vda", "/images/a.qcow2")).unwrap();
        assert!(store.lookup_display("disk vda /images/a.qcow2").unwrap().is_some());

        store.set_param("vda", "source", "/images/z.qcow2").unwrap();
        assert!(store.lookup_display("disk vda /images/a.qcow2").unwrap().is_none());
        assert_eq!(
            store.lookup_display("disk vda /images/z.qcow2").unwrap().unwrap().key,
            "vda"
        );
    }

    #[test]
    fn test_mark_applied_skips_items_added_later() {
        let store = CategoryStore::new(HardwareCategory::Disk);
        store.add_placeholder(disk("vda", "/images/a.qcow2")).unwrap();
        let sent = store.items().unwrap();
        store.add_placeholder(disk("vdb", "/images/b.qcow2")).unwrap();

        assert_eq!(store.mark_applied(&sent).unwrap(), 1);
        assert!(!store.get("vda").unwrap().unwrap().is_new);
        assert!(store.get("vdb").unwrap().unwrap().is_new);
        assert_eq!(store.changed_items().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_unknown_key() {
        let store = CategoryStore::new(HardwareCategory::Sound);
        assert!(matches!(store.remove("3"), Err(DomainError::DeviceNotFound(_))));
    }

    #[test]
    fn test_compare_keys() {
        assert_eq!(compare_keys("2", "10"), Ordering::Less);
        assert_eq!(compare_keys("vdb", "vda"), Ordering::Greater);
        assert_eq!(compare_keys("hdc", "vda"), Ordering::Less);
    }
}
