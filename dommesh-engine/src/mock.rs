//! In-memory cluster for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::{DomainError, Result};
use crate::hardware::{HardwareCategory, GENERATE};
use crate::traits::{CommandFacade, PresentationSink, SnapshotProvider};
use crate::types::*;

/// Mock cluster implementing both the snapshot provider and the command facade.
///
/// Domains live in memory per host. Useful for:
/// - Unit and integration testing
/// - Running the node daemon without real hosts
///
/// Lifecycle commands can be made to show up only after a number of snapshot
/// reads ([`MockCluster::set_command_delay`]); `u32::MAX` freezes them.
pub struct MockCluster {
    domains: RwLock<HashMap<(String, String), MockDomain>>,
    staged: RwLock<HashMap<String, HostSnapshot>>,
    rejecting: RwLock<HashSet<String>>,
    failing_defines: RwLock<HashSet<String>>,
    unreachable: RwLock<HashSet<String>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    device_writes: Mutex<Vec<(String, HardwareCategory, String)>>,
    command_delay: AtomicU32,
}

#[derive(Default)]
struct MockDomain {
    snapshot: HostSnapshot,
    pending: Option<PendingEffect>,
}

struct PendingEffect {
    reads_left: u32,
    action: LifecycleAction,
}

impl MockDomain {
    /// Advance a pending lifecycle effect by one read.
    fn tick(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.reads_left == u32::MAX {
            return;
        }
        if pending.reads_left > 0 {
            pending.reads_left -= 1;
            return;
        }
        let action = pending.action;
        self.pending = None;
        apply_effect(&mut self.snapshot, action);
    }
}

fn apply_effect(snapshot: &mut HostSnapshot, action: LifecycleAction) {
    match action {
        LifecycleAction::Start => {
            snapshot.running = true;
            snapshot.suspended = false;
        }
        LifecycleAction::Shutdown | LifecycleAction::Destroy => {
            snapshot.running = false;
            snapshot.suspended = false;
        }
        LifecycleAction::Suspend => snapshot.suspended = true,
        LifecycleAction::Resume => snapshot.suspended = false,
        LifecycleAction::Reboot => {}
    }
}

fn lock_err() -> DomainError {
    DomainError::Internal("Lock poisoned".to_string())
}

fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0] & 0x3f, bytes[1], bytes[2])
}

fn next_free_disk(taken: &BTreeMap<String, Params>) -> String {
    (b'a'..=b'z')
        .map(|c| format!("vd{}", c as char))
        .find(|name| !taken.contains_key(name))
        .unwrap_or_else(|| format!("vd{}", taken.len()))
}

fn next_free_index(taken: &BTreeMap<String, Params>) -> String {
    (0..)
        .map(|i: u32| i.to_string())
        .find(|index| !taken.contains_key(index))
        .unwrap_or_default()
}

impl MockCluster {
    /// Create an empty mock cluster.
    pub fn new() -> Self {
        info!("Creating mock cluster");
        Self {
            domains: RwLock::new(HashMap::new()),
            staged: RwLock::new(HashMap::new()),
            rejecting: RwLock::new(HashSet::new()),
            failing_defines: RwLock::new(HashSet::new()),
            unreachable: RwLock::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            device_writes: Mutex::new(Vec::new()),
            command_delay: AtomicU32::new(0),
        }
    }

    /// Put a domain with the given state on a host, replacing what was there.
    pub fn seed(&self, host: &str, domain: &str, snapshot: HostSnapshot) {
        if let Ok(mut domains) = self.domains.write() {
            domains.insert(
                (host.to_string(), domain.to_string()),
                MockDomain {
                    snapshot,
                    pending: None,
                },
            );
        }
    }

    /// Number of snapshot reads before a lifecycle command shows up.
    pub fn set_command_delay(&self, reads: u32) {
        self.command_delay.store(reads, Ordering::SeqCst);
    }

    /// Reject every lifecycle command sent to a host.
    pub fn reject_commands_on(&self, host: &str) {
        if let Ok(mut rejecting) = self.rejecting.write() {
            rejecting.insert(host.to_string());
        }
    }

    /// Fail every `define_or_modify` sent to a host.
    pub fn fail_defines_on(&self, host: &str) {
        if let Ok(mut failing) = self.failing_defines.write() {
            failing.insert(host.to_string());
        }
    }

    /// Make a host return no snapshot.
    pub fn set_unreachable(&self, host: &str) {
        if let Ok(mut unreachable) = self.unreachable.write() {
            unreachable.insert(host.to_string());
        }
    }

    /// Read a host's view of a domain, advancing pending effects.
    ///
    /// Returns `None` for unreachable hosts and an undefined snapshot for
    /// domains the host does not know.
    pub fn observe(&self, host: &str, domain: &str) -> Option<HostSnapshot> {
        if self.unreachable.read().ok()?.contains(host) {
            return None;
        }
        let mut domains = self.domains.write().ok()?;
        match domains.get_mut(&(host.to_string(), domain.to_string())) {
            Some(entry) => {
                entry.tick();
                Some(entry.snapshot.clone())
            }
            None => Some(HostSnapshot::default()),
        }
    }

    /// How many times a collaborator method was called.
    pub fn calls(&self, method: &str) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Every device write as (host, category, key), in call order.
    pub fn device_writes(&self) -> Vec<(String, HardwareCategory, String)> {
        self.device_writes
            .lock()
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }

    /// Forget recorded calls.
    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
        if let Ok(mut writes) = self.device_writes.lock() {
            writes.clear();
        }
    }

    fn record(&self, method: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method).or_insert(0) += 1;
        }
    }

    fn lifecycle(&self, action: LifecycleAction, host: &Host, domain: &str) -> Result<()> {
        info!(host = %host, domain = %domain, action = %action, "Mock lifecycle command");

        let rejecting = self.rejecting.read().map_err(|_| lock_err())?;
        if rejecting.contains(&host.name) || !host.connected {
            return Err(DomainError::CommandRejected(format!(
                "{} of {} refused by {}",
                action, domain, host
            )));
        }
        drop(rejecting);

        let mut domains = self.domains.write().map_err(|_| lock_err())?;
        let entry = domains
            .get_mut(&(host.name.clone(), domain.to_string()))
            .filter(|entry| entry.snapshot.defined)
            .ok_or_else(|| DomainError::DomainNotFound(format!("{} on {}", domain, host)))?;

        let running = entry.snapshot.running;
        let suspended = entry.snapshot.suspended;
        let allowed = match action {
            LifecycleAction::Start => !running,
            LifecycleAction::Shutdown | LifecycleAction::Reboot | LifecycleAction::Suspend => {
                running && !suspended
            }
            LifecycleAction::Destroy => running,
            LifecycleAction::Resume => suspended,
        };
        if !allowed {
            return Err(DomainError::InvalidState(format!(
                "cannot {} {} on {}",
                action, domain, host
            )));
        }

        let delay = self.command_delay.load(Ordering::SeqCst);
        if delay == 0 {
            apply_effect(&mut entry.snapshot, action);
        } else {
            entry.pending = Some(PendingEffect {
                reads_left: delay,
                action,
            });
        }
        Ok(())
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotProvider for MockCluster {
    async fn snapshot(&self, host: &Host, domain: &str) -> Result<Option<HostSnapshot>> {
        self.record("snapshot");
        if !host.connected {
            return Ok(None);
        }
        Ok(self.observe(&host.name, domain))
    }
}

#[async_trait]
impl CommandFacade for MockCluster {
    async fn start(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("start");
        self.lifecycle(LifecycleAction::Start, host, domain)
    }

    async fn shutdown(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("shutdown");
        self.lifecycle(LifecycleAction::Shutdown, host, domain)
    }

    async fn reboot(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("reboot");
        self.lifecycle(LifecycleAction::Reboot, host, domain)
    }

    async fn destroy(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("destroy");
        self.lifecycle(LifecycleAction::Destroy, host, domain)
    }

    async fn suspend(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("suspend");
        self.lifecycle(LifecycleAction::Suspend, host, domain)
    }

    async fn resume(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("resume");
        self.lifecycle(LifecycleAction::Resume, host, domain)
    }

    #[instrument(skip(self, host, _options), fields(host = %host))]
    async fn undefine(&self, host: &Host, domain: &str, _options: &CommandOptions) -> Result<()> {
        self.record("undefine");
        info!("Undefining mock domain");

        let mut domains = self.domains.write().map_err(|_| lock_err())?;
        let key = (host.name.clone(), domain.to_string());
        let entry = domains
            .get(&key)
            .filter(|entry| entry.snapshot.defined)
            .ok_or_else(|| DomainError::DomainNotFound(format!("{} on {}", domain, host)))?;

        if entry.snapshot.running {
            return Err(DomainError::UndefineFailed(format!(
                "{} must be stopped before it is undefined on {}",
                domain, host
            )));
        }

        domains.remove(&key);
        Ok(())
    }

    #[instrument(skip(self, host, params), fields(host = %host))]
    async fn define_or_modify(
        &self,
        host: &Host,
        domain: &str,
        params: &Params,
    ) -> Result<DefinitionHandle> {
        self.record("define_or_modify");

        let failing = self.failing_defines.read().map_err(|_| lock_err())?;
        if failing.contains(&host.name) || !host.connected {
            return Err(DomainError::DefineFailed(format!("{} refused by {}", domain, host)));
        }
        drop(failing);

        let current = {
            let domains = self.domains.read().map_err(|_| lock_err())?;
            domains
                .get(&(host.name.clone(), domain.to_string()))
                .map(|entry| entry.snapshot.clone())
                .filter(|snapshot| snapshot.defined)
        };
        let created = current.is_none();
        let mut staged = current.unwrap_or_else(HostSnapshot::defined);
        staged.params.extend(params.clone());

        let handle = DefinitionHandle {
            id: uuid::Uuid::new_v4().to_string(),
            host: host.name.clone(),
            domain: domain.to_string(),
            created,
        };
        self.staged
            .write()
            .map_err(|_| lock_err())?
            .insert(handle.id.clone(), staged);

        info!(handle = %handle.id, created, "Mock definition opened");
        Ok(handle)
    }

    async fn modify_device(&self, handle: &DefinitionHandle, update: &DeviceUpdate) -> Result<()> {
        self.record("modify_device");

        let mut staged = self.staged.write().map_err(|_| lock_err())?;
        let snapshot = staged
            .get_mut(&handle.id)
            .ok_or_else(|| DomainError::Internal(format!("unknown handle {}", handle.id)))?;

        let descriptor = update.category.descriptor();
        let devices = snapshot.devices.entry(update.category).or_default();

        let requested = update
            .params
            .get(descriptor.key_param)
            .filter(|v| !v.is_empty() && v.as_str() != GENERATE)
            .cloned();
        let key = if !update.is_new {
            update.key.clone()
        } else {
            match requested {
                Some(key) => key,
                None => match update.category {
                    HardwareCategory::Interface => generate_mac_address(),
                    HardwareCategory::Disk => next_free_disk(devices),
                    _ => next_free_index(devices),
                },
            }
        };

        let entry = devices.entry(key.clone()).or_default();
        entry.extend(update.params.clone());
        entry.insert(descriptor.key_param.to_string(), key.clone());

        debug!(handle = %handle.id, category = %update.category, key = %key, "Mock device written");
        drop(staged);

        if let Ok(mut writes) = self.device_writes.lock() {
            writes.push((handle.host.clone(), update.category, update.key.clone()));
        }
        Ok(())
    }

    async fn save(&self, handle: &DefinitionHandle) -> Result<()> {
        self.record("save");

        let snapshot = self
            .staged
            .write()
            .map_err(|_| lock_err())?
            .remove(&handle.id)
            .ok_or_else(|| DomainError::Internal(format!("unknown handle {}", handle.id)))?;

        let mut domains = self.domains.write().map_err(|_| lock_err())?;
        let entry = domains
            .entry((handle.host.clone(), handle.domain.clone()))
            .or_default();
        entry.snapshot = snapshot;

        info!(host = %handle.host, domain = %handle.domain, "Mock definition saved");
        Ok(())
    }

    async fn remove_device(
        &self,
        host: &Host,
        domain: &str,
        category: HardwareCategory,
        key: &str,
    ) -> Result<()> {
        self.record("remove_device");

        let mut domains = self.domains.write().map_err(|_| lock_err())?;
        let entry = domains
            .get_mut(&(host.name.clone(), domain.to_string()))
            .ok_or_else(|| DomainError::DomainNotFound(format!("{} on {}", domain, host)))?;
        entry
            .snapshot
            .devices
            .get_mut(&category)
            .and_then(|devices| devices.remove(key))
            .ok_or_else(|| {
                DomainError::DeviceNotFound(format!("{} {} on {}", category, key, host))
            })?;
        Ok(())
    }
}

/// Presentation sink counting the notifications it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    structural: AtomicU32,
    values: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural notifications received so far.
    pub fn structural_changes(&self) -> u32 {
        self.structural.load(Ordering::SeqCst)
    }

    /// Value notifications received so far.
    pub fn value_changes(&self) -> u32 {
        self.values.load(Ordering::SeqCst)
    }
}

impl PresentationSink for RecordingSink {
    fn notify_structural_change(&self, _domain: &str) {
        self.structural.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_value_change(&self, _domain: &str) {
        self.values.fetch_add(1, Ordering::SeqCst);
    }
}
