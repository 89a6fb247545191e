//! Domain registry and periodic cluster poller.
//!
//! The registry keeps one `DomainOrchestrator` per domain name for the
//! lifetime of the daemon. The poller walks every registered domain on a
//! fixed interval and runs an update pass, which pulls fresh host snapshots
//! and reconciles the hardware tree.
//!
//! Registering a new domain requests an immediate pass, so the running
//! poller reconciles it without waiting for the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use dommesh_engine::{Collaborators, DomainOrchestrator, Host, PollSettings, PresentationSink};

/// Sink that turns presentation notifications into log lines.
#[derive(Debug, Default)]
pub struct LogSink;

impl PresentationSink for LogSink {
    fn notify_structural_change(&self, domain: &str) {
        info!(domain = %domain, "Hardware layout changed");
    }

    fn notify_value_change(&self, domain: &str) {
        debug!(domain = %domain, "Domain values refreshed");
    }
}

/// Result of one update pass for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub domain: String,
    /// The hardware layout changed
    pub structural: bool,
    /// Status line after the pass, or the error it failed with
    pub status: Result<String, String>,
}

/// Owns the orchestrators of every known domain.
pub struct DomainRegistry {
    cluster: Vec<Host>,
    collaborators: Collaborators,
    settings: PollSettings,
    domains: RwLock<HashMap<String, Arc<DomainOrchestrator>>>,
    /// Registration order, so passes visit domains deterministically
    order: RwLock<Vec<String>>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: RwLock<Option<mpsc::Receiver<()>>>,
}

impl DomainRegistry {
    /// Create an empty registry.
    pub fn new(cluster: Vec<Host>, collaborators: Collaborators, settings: PollSettings) -> Self {
        // One pending request is enough; further ones fold into it.
        let (tx, rx) = mpsc::channel(1);
        Self {
            cluster,
            collaborators,
            settings,
            domains: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            trigger_tx: tx,
            trigger_rx: RwLock::new(Some(rx)),
        }
    }

    /// Orchestrator of a domain, created on first observation.
    pub async fn observe(&self, domain: &str) -> Arc<DomainOrchestrator> {
        if let Some(existing) = self.domains.read().await.get(domain) {
            return Arc::clone(existing);
        }

        let mut domains = self.domains.write().await;
        if let Some(existing) = domains.get(domain) {
            return Arc::clone(existing);
        }

        info!(domain = %domain, hosts = self.cluster.len(), "Registering domain");
        let orchestrator = Arc::new(DomainOrchestrator::new(
            domain,
            self.cluster.clone(),
            self.collaborators.clone(),
            self.settings,
        ));
        domains.insert(domain.to_string(), Arc::clone(&orchestrator));
        self.order.write().await.push(domain.to_string());
        self.request_pass();
        orchestrator
    }

    /// Orchestrator of a registered domain.
    pub async fn get(&self, domain: &str) -> Option<Arc<DomainOrchestrator>> {
        self.domains.read().await.get(domain).cloned()
    }

    /// Registered domain names, in registration order.
    pub async fn names(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.order.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ask the running poller for an immediate update pass.
    pub fn request_pass(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(()) => debug!("Immediate update pass requested"),
            Err(TrySendError::Full(_)) => debug!("Update pass already pending"),
            Err(TrySendError::Closed(_)) => warn!("Poller is gone, pass request dropped"),
        }
    }

    /// Run one update pass over every registered domain.
    pub async fn poll_once(&self) -> Vec<PassSummary> {
        let mut summaries = Vec::new();
        for name in self.names().await {
            let Some(orchestrator) = self.get(&name).await else {
                continue;
            };

            let summary = match orchestrator.update_parameters().await {
                Ok(structural) => {
                    let status = orchestrator.summary().map_err(|e| e.to_string());
                    PassSummary {
                        domain: name.clone(),
                        structural,
                        status,
                    }
                }
                Err(e) => {
                    warn!(domain = %name, error = %e, "Update pass failed");
                    PassSummary {
                        domain: name.clone(),
                        structural: false,
                        status: Err(e.to_string()),
                    }
                }
            };

            match &summary.status {
                Ok(status) => info!(domain = %name, structural = summary.structural, "{}", status),
                Err(e) => debug!(domain = %name, error = %e, "No status"),
            }
            summaries.push(summary);
        }
        summaries
    }

    /// Poll every `period` until the task is dropped.
    ///
    /// Only one poller may run per registry.
    #[instrument(skip(self))]
    pub async fn run(&self, period: Duration) {
        let mut trigger_rx = {
            let mut rx_guard = self.trigger_rx.write().await;
            match rx_guard.take() {
                Some(rx) => rx,
                None => {
                    error!("DomainRegistry::run called multiple times - only one poller allowed");
                    return;
                }
            }
        };

        info!(period_secs = period.as_secs(), "Starting domain poller");
        let mut timer = interval(period);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll_once().await;
                }
                Some(_) = trigger_rx.recv() => {
                    debug!("Immediate update pass triggered");
                    self.poll_once().await;
                    timer.reset();
                }
            }
        }
    }

    /// Detach every orchestrator and cancel their transition polls.
    pub async fn shutdown(&self) {
        for orchestrator in self.domains.read().await.values() {
            orchestrator.detach();
            orchestrator.stop_polling();
        }
        info!("Domain registry shut down");
    }
}
