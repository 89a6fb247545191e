//! Collaborator interfaces the engine drives.
//!
//! The engine owns no transport: snapshots come from a [`SnapshotProvider`],
//! mutations go through a [`CommandFacade`] and rendering is left to a
//! [`PresentationSink`].

use async_trait::async_trait;

use crate::error::Result;
use crate::hardware::HardwareCategory;
use crate::types::*;

/// Source of per-host domain snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Refresh and return the host's view of a domain.
    ///
    /// `Ok(None)` means the host could not report (e.g. disconnected).
    async fn snapshot(&self, host: &Host, domain: &str) -> Result<Option<HostSnapshot>>;
}

/// Issues commands against one host and domain.
///
/// An `Err` from a lifecycle method means the command was rejected.
#[async_trait]
pub trait CommandFacade: Send + Sync {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn start(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    async fn shutdown(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    async fn reboot(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    /// Power off without a graceful shutdown.
    async fn destroy(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    async fn suspend(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    async fn resume(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Remove the domain definition from a host.
    async fn undefine(&self, host: &Host, domain: &str, options: &CommandOptions) -> Result<()>;

    /// Open a definition for writing, creating it when it does not exist.
    ///
    /// `params` is the full domain parameter set on create and the diff on modify.
    async fn define_or_modify(
        &self,
        host: &Host,
        domain: &str,
        params: &Params,
    ) -> Result<DefinitionHandle>;

    /// Write one device into an open definition.
    async fn modify_device(&self, handle: &DefinitionHandle, update: &DeviceUpdate) -> Result<()>;

    /// Persist an open definition on its host.
    async fn save(&self, handle: &DefinitionHandle) -> Result<()>;

    /// Remove one device from a defined domain.
    async fn remove_device(
        &self,
        host: &Host,
        domain: &str,
        category: HardwareCategory,
        key: &str,
    ) -> Result<()>;
}

/// Receives fire-and-forget notifications for rendering.
pub trait PresentationSink: Send + Sync {
    /// Items were added, removed or re-keyed.
    fn notify_structural_change(&self, domain: &str);

    /// Only values changed.
    fn notify_value_change(&self, domain: &str);
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn notify_structural_change(&self, _domain: &str) {}

    fn notify_value_change(&self, _domain: &str) {}
}
