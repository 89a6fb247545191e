//! Type definitions shared by the engine and its collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareCategory;

/// Parameter name to value mapping of a device or a domain.
pub type Params = BTreeMap<String, String>;

/// Number of poll iterations a lifecycle transition is waited for.
pub const ACTION_TIMEOUT: u32 = 20;

/// Default pause between two poll iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// HOSTS AND SNAPSHOTS
// =============================================================================

/// A cluster member capable of defining and running domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Host name, unique within the cluster
    pub name: String,
    /// Whether the host is currently reachable
    #[serde(default = "default_connected")]
    pub connected: bool,
}

fn default_connected() -> bool {
    true
}

impl Host {
    /// Create a connected host.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: true,
        }
    }

    /// Create a host that is known but not reachable.
    pub fn disconnected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: false,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One host's view of a domain.
///
/// A host that does not know the domain reports `defined == false` and no devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSnapshot {
    /// The domain is defined on this host
    pub defined: bool,
    /// The domain is running on this host
    pub running: bool,
    /// The domain is paused on this host (implies running)
    pub suspended: bool,
    /// Domain-level parameters as reported by the host
    pub params: Params,
    /// Devices per category, keyed by the category-specific key
    pub devices: BTreeMap<HardwareCategory, BTreeMap<String, Params>>,
}

impl HostSnapshot {
    /// Snapshot of a host where the domain is defined but stopped.
    pub fn defined() -> Self {
        Self {
            defined: true,
            ..Default::default()
        }
    }

    /// Add a device to the snapshot.
    pub fn with_device(
        mut self,
        category: HardwareCategory,
        key: impl Into<String>,
        params: Params,
    ) -> Self {
        self.devices
            .entry(category)
            .or_default()
            .insert(key.into(), params);
        self
    }

    /// Devices of one category, if any were reported.
    pub fn devices_of(&self, category: HardwareCategory) -> Option<&BTreeMap<String, Params>> {
        self.devices.get(&category)
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Lifecycle commands a user can issue against one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Shutdown,
    Reboot,
    Destroy,
    Suspend,
    Resume,
}

impl LifecycleAction {
    /// The transition set a host joins after this command is accepted.
    ///
    /// Reboot leaves the domain running and is not tracked.
    pub fn transition(&self) -> Option<TransitionKind> {
        match self {
            LifecycleAction::Start => Some(TransitionKind::Starting),
            LifecycleAction::Shutdown | LifecycleAction::Destroy => {
                Some(TransitionKind::ShuttingDown)
            }
            LifecycleAction::Suspend => Some(TransitionKind::Suspending),
            LifecycleAction::Resume => Some(TransitionKind::Resuming),
            LifecycleAction::Reboot => None,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Shutdown => "shutdown",
            LifecycleAction::Reboot => "reboot",
            LifecycleAction::Destroy => "destroy",
            LifecycleAction::Suspend => "suspend",
            LifecycleAction::Resume => "resume",
        };
        f.write_str(name)
    }
}

/// In-flight transitions tracked per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Starting,
    ShuttingDown,
    Suspending,
    Resuming,
}

impl TransitionKind {
    /// All transition kinds.
    pub const ALL: [TransitionKind; 4] = [
        TransitionKind::Starting,
        TransitionKind::ShuttingDown,
        TransitionKind::Suspending,
        TransitionKind::Resuming,
    ];
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionKind::Starting => "starting",
            TransitionKind::ShuttingDown => "shutting down",
            TransitionKind::Suspending => "suspending",
            TransitionKind::Resuming => "resuming",
        };
        f.write_str(name)
    }
}

/// Power state of a domain on one host as derived from the aggregate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPowerState {
    Undefined,
    Stopped,
    Starting,
    Running,
    ShuttingDown,
    Suspending,
    Suspended,
    Resuming,
}

/// Options passed through to the command facade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandOptions {
    /// Extra arguments understood by the facade (e.g. `--managed-save`)
    pub extra_args: Vec<String>,
}

/// Whether `apply` commits changes or only validates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Live,
    Simulate,
}

/// Poll loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between two iterations
    pub interval: Duration,
    /// Maximum number of iterations before giving up
    pub action_timeout: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            action_timeout: ACTION_TIMEOUT,
        }
    }
}

impl PollSettings {
    /// Upper bound on how long one transition is waited for.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.action_timeout
    }
}

// =============================================================================
// DEFINITIONS
// =============================================================================

/// Handle to a definition opened on one host by `define_or_modify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionHandle {
    /// Opaque identifier assigned by the facade
    pub id: String,
    /// Host the definition lives on
    pub host: String,
    /// Domain name
    pub domain: String,
    /// True when the definition did not exist before
    pub created: bool,
}

/// One device's parameters pushed into an open definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    /// Device category
    pub category: HardwareCategory,
    /// Local key of the item (may be a placeholder key)
    pub key: String,
    /// Parameters to write; a full set on create, a diff on modify
    pub params: Params,
    /// The device does not exist in the definition yet
    pub is_new: bool,
}

/// Outcome of one convergence pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Hosts that received a fresh definition
    pub created: BTreeSet<String>,
    /// Hosts whose existing definition received a diff
    pub modified: BTreeSet<String>,
    /// Hosts whose definition was removed
    pub undefined: BTreeSet<String>,
    /// Desired hosts that needed no change
    pub unchanged: BTreeSet<String>,
    /// Hosts where a collaborator call failed, with the reason
    pub failed: Vec<(String, String)>,
    /// When the pass completed
    pub finished_at: Option<DateTime<Utc>>,
}

impl ApplyReport {
    /// True when every host was processed without error.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_transition_mapping() {
        assert_eq!(LifecycleAction::Start.transition(), Some(TransitionKind::Starting));
        assert_eq!(LifecycleAction::Destroy.transition(), Some(TransitionKind::ShuttingDown));
        assert_eq!(LifecycleAction::Shutdown.transition(), Some(TransitionKind::ShuttingDown));
        assert_eq!(LifecycleAction::Resume.transition(), Some(TransitionKind::Resuming));
        assert_eq!(LifecycleAction::Reboot.transition(), None);
    }

    #[test]
    fn test_snapshot_from_json() {
        let json = r#"{
            "defined": true,
            "running": true,
            "devices": {
                "interface": { "52:54:00:aa:bb:cc": { "type": "network", "source": "default" } }
            }
        }"#;

        let snapshot: HostSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.defined);
        assert!(!snapshot.suspended);
        let nics = snapshot.devices_of(HardwareCategory::Interface).unwrap();
        assert_eq!(nics["52:54:00:aa:bb:cc"]["source"], "default");
    }

    #[test]
    fn test_max_wait() {
        let settings = PollSettings::default();
        assert_eq!(settings.max_wait(), Duration::from_secs(20));
    }
}
