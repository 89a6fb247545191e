//! Per-domain orchestrator.
//!
//! [`DomainOrchestrator`] owns everything the engine knows about one domain:
//! the nine category stores, the aggregate state, the transition controller
//! and the cluster-wide status lock. It is the only type callers need to
//! drive a domain.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{AggregateView, DomainAggregateState};
use crate::convergence::{ConvergenceEngine, DesiredDefinition};
use crate::error::{DomainError, Result};
use crate::hardware::{HardwareCategory, HardwareItem, ParamSet};
use crate::reconcile::{merge_external, reconcile};
use crate::store::CategoryStore;
use crate::traits::{CommandFacade, PresentationSink, SnapshotProvider};
use crate::transition::{StatusRefresher, TransitionController};
use crate::types::*;

/// Collaborators an orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn SnapshotProvider>,
    pub commands: Arc<dyn CommandFacade>,
    pub sink: Arc<dyn PresentationSink>,
}

impl Collaborators {
    /// Use one backend as both snapshot provider and command facade.
    pub fn from_backend<B>(backend: Arc<B>, sink: Arc<dyn PresentationSink>) -> Self
    where
        B: SnapshotProvider + CommandFacade + 'static,
    {
        Self {
            provider: backend.clone(),
            commands: backend,
            sink,
        }
    }
}

/// Drives one domain across a cluster.
pub struct DomainOrchestrator {
    core: Arc<DomainCore>,
}

struct DomainCore {
    domain: String,
    cluster: Vec<Host>,
    collaborators: Collaborators,
    options: CommandOptions,
    stores: Vec<CategoryStore>,
    aggregate: Arc<DomainAggregateState>,
    transitions: TransitionController,
    /// Serializes apply against reconciliation passes.
    status_lock: tokio::sync::Mutex<()>,
    params: Mutex<ParamSet>,
    is_new: AtomicBool,
    detached: AtomicBool,
}

impl DomainOrchestrator {
    /// Orchestrator for a domain that already exists somewhere in the cluster.
    pub fn new(
        domain: impl Into<String>,
        cluster: Vec<Host>,
        collaborators: Collaborators,
        settings: PollSettings,
    ) -> Self {
        Self::build(domain.into(), cluster, collaborators, settings, ParamSet::default(), false)
    }

    /// Orchestrator for a domain that is defined nowhere yet.
    ///
    /// The first [`apply`](Self::apply) creates it with `params` on every
    /// desired host.
    pub fn new_domain(
        domain: impl Into<String>,
        cluster: Vec<Host>,
        collaborators: Collaborators,
        settings: PollSettings,
        params: Params,
    ) -> Self {
        Self::build(
            domain.into(),
            cluster,
            collaborators,
            settings,
            ParamSet::unsaved(params),
            true,
        )
    }

    fn build(
        domain: String,
        cluster: Vec<Host>,
        collaborators: Collaborators,
        settings: PollSettings,
        params: ParamSet,
        is_new: bool,
    ) -> Self {
        let aggregate = Arc::new(DomainAggregateState::new());
        let core = DomainCore {
            domain,
            cluster,
            collaborators,
            options: CommandOptions::default(),
            stores: HardwareCategory::ALL.iter().map(|c| CategoryStore::new(*c)).collect(),
            transitions: TransitionController::new(Arc::clone(&aggregate), settings),
            aggregate,
            status_lock: tokio::sync::Mutex::new(()),
            params: Mutex::new(params),
            is_new: AtomicBool::new(is_new),
            detached: AtomicBool::new(false),
        };
        Self { core: Arc::new(core) }
    }

    /// Domain name.
    pub fn domain(&self) -> &str {
        &self.core.domain
    }

    /// Hosts of the cluster, in iteration order.
    pub fn cluster(&self) -> &[Host] {
        &self.core.cluster
    }

    /// True until the domain has been applied once.
    pub fn is_new(&self) -> bool {
        self.core.is_new.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Pull fresh snapshots and bring the local state in line with them.
    ///
    /// Returns true when any category gained, lost or re-keyed an item.
    /// Once the orchestrator is detached this is a no-op returning false.
    pub async fn update_parameters(&self) -> Result<bool> {
        let _guard = self.core.status_lock.lock().await;
        self.core.update_parameters_locked().await
    }

    /// Push the local configuration to the cluster.
    ///
    /// `desired` is the set of hosts that should hold the definition.
    /// Under [`RunMode::Simulate`] only validation runs.
    #[instrument(skip(self, desired), fields(domain = %self.core.domain))]
    pub async fn apply(&self, mode: RunMode, desired: &BTreeSet<String>) -> Result<ApplyReport> {
        for host in desired {
            if self.core.host(host).is_none() {
                return Err(DomainError::InvalidParameter(format!(
                    "host {} is not part of the cluster",
                    host
                )));
            }
        }

        if mode == RunMode::Simulate {
            self.core.desired_definition()?.validate(mode)?;
            info!("Simulated apply, definition is valid");
            return Ok(ApplyReport {
                finished_at: Some(chrono::Utc::now()),
                ..Default::default()
            });
        }

        let report = {
            let _guard = self.core.status_lock.lock().await;
            let definition = self.core.desired_definition()?;
            definition.validate(mode)?;
            let view = self.core.refresh_aggregate().await?;

            let engine = ConvergenceEngine::new(self.core.collaborators.commands.as_ref())
                .with_options(self.core.options.clone());
            let report = engine
                .converge(
                    &self.core.domain,
                    &self.core.cluster,
                    &view.defined_on,
                    desired,
                    self.is_new(),
                    &definition,
                )
                .await;

            if report.created.is_empty() && report.modified.is_empty() {
                debug!(failed = report.failed.len(), "Nothing written, local edits kept");
            } else {
                self.core.mark_applied(&definition)?;
            }

            self.core.refresh_aggregate().await?;
            report
        };

        self.update_parameters().await?;
        Ok(report)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the domain on a host. Returns false if the command was rejected.
    pub async fn start(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Start, host).await
    }

    /// Gracefully shut the domain down on a host.
    pub async fn shutdown(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Shutdown, host).await
    }

    pub async fn reboot(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Reboot, host).await
    }

    /// Power the domain off on a host.
    pub async fn destroy(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Destroy, host).await
    }

    pub async fn suspend(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Suspend, host).await
    }

    pub async fn resume(&self, host: &str) -> bool {
        self.lifecycle(LifecycleAction::Resume, host).await
    }

    async fn lifecycle(&self, action: LifecycleAction, host: &str) -> bool {
        let Some(host) = self.core.host(host).cloned() else {
            warn!(domain = %self.core.domain, host = %host, action = %action, "Unknown host");
            return false;
        };
        let refresher: Arc<dyn StatusRefresher> = self.core.clone();
        self.core
            .transitions
            .request_transition(
                action,
                &host,
                &self.core.domain,
                self.core.collaborators.commands.as_ref(),
                &self.core.options,
                refresher,
            )
            .await
    }

    /// Number of transition poll jobs currently running.
    pub fn active_pollers(&self) -> usize {
        self.core.transitions.active_pollers()
    }

    /// True while a poll job for the kind runs.
    pub fn is_polling(&self, kind: TransitionKind) -> bool {
        self.core.transitions.is_polling(kind)
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Add a placeholder device and return its key.
    ///
    /// `params` is merged over the category defaults.
    pub fn add_hardware(&self, category: HardwareCategory, params: Params) -> Result<String> {
        let mut merged = (category.descriptor().defaults)();
        merged.extend(params);
        let key = self.core.store(category).add_placeholder(merged)?;
        info!(domain = %self.core.domain, category = %category, key = %key, "Hardware added");
        self.core.notify(true);
        Ok(key)
    }

    /// Edit one live parameter of a device.
    pub fn set_param(
        &self,
        category: HardwareCategory,
        key: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.core.store(category).set_param(key, name, value)?;
        self.core.notify(false);
        Ok(())
    }

    /// Edit one live domain-level parameter.
    pub fn set_domain_param(&self, name: &str, value: &str) -> Result<()> {
        self.core.lock_params()?.set(name, value);
        self.core.notify(false);
        Ok(())
    }

    /// Live value of a domain-level parameter.
    pub fn domain_param(&self, name: &str) -> Result<Option<String>> {
        Ok(self.core.lock_params()?.get(name).map(str::to_string))
    }

    /// Remove a device locally and, if it was applied, from every host
    /// that defines the domain.
    #[instrument(skip(self), fields(domain = %self.core.domain))]
    pub async fn remove_hardware(&self, category: HardwareCategory, key: &str) -> Result<()> {
        let _guard = self.core.status_lock.lock().await;
        let store = self.core.store(category);
        let item = store
            .get(key)?
            .ok_or_else(|| DomainError::DeviceNotFound(format!("{} {}", category, key)))?;

        if !item.is_new && !item.generate {
            let defined_on = self.core.aggregate.view()?.defined_on;
            for host in self.core.cluster.iter().filter(|h| defined_on.contains(&h.name)) {
                if !host.connected {
                    warn!(host = %host, "Host unreachable, device left in place");
                    continue;
                }
                if let Err(e) = self
                    .core
                    .collaborators
                    .commands
                    .remove_device(host, &self.core.domain, category, key)
                    .await
                {
                    warn!(host = %host, error = %e, "Failed to remove device");
                }
            }
        }

        store.remove(key)?;
        info!(category = %category, key = %key, "Hardware removed");
        self.core.notify(true);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Items of one category in positional order.
    pub fn items(&self, category: HardwareCategory) -> Result<Vec<HardwareItem>> {
        self.core.store(category).items()
    }

    /// One item by key.
    pub fn item(&self, category: HardwareCategory, key: &str) -> Result<Option<HardwareItem>> {
        self.core.store(category).get(key)
    }

    /// Resolve a display string to the item it names.
    pub fn lookup_display(&self, display: &str) -> Result<Option<HardwareItem>> {
        for store in &self.core.stores {
            if let Some(item) = store.lookup_display(display)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Global device order as (category, key).
    pub fn layout(&self) -> Result<Vec<(HardwareCategory, String)>> {
        let mut layout = Vec::new();
        for store in &self.core.stores {
            let category = store.category();
            layout.extend(store.keys()?.into_iter().map(|key| (category, key)));
        }
        Ok(layout)
    }

    /// Consistent copy of the aggregate state.
    pub fn view(&self) -> Result<AggregateView> {
        self.core.aggregate.view()
    }

    pub fn power_state(&self, host: &str) -> Result<HostPowerState> {
        self.core.aggregate.power_state(host)
    }

    /// One-line status, with the animation frame while transitioning.
    pub fn summary(&self) -> Result<String> {
        Ok(self.core.aggregate.view()?.summary())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Mark the local anchor as gone; later reconciliation passes do nothing.
    pub fn detach(&self) {
        self.core.detached.store(true, Ordering::SeqCst);
        debug!(domain = %self.core.domain, "Orchestrator detached");
    }

    pub fn is_detached(&self) -> bool {
        self.core.detached.load(Ordering::SeqCst)
    }

    /// Cancel every running transition poll. Later lifecycle calls are
    /// tracked by new polls.
    pub fn stop_polling(&self) {
        self.core.transitions.shutdown();
    }
}

impl Drop for DomainOrchestrator {
    fn drop(&mut self) {
        self.core.transitions.shutdown();
    }
}

impl DomainCore {
    fn store(&self, category: HardwareCategory) -> &CategoryStore {
        &self.stores[category.rank()]
    }

    fn host(&self, name: &str) -> Option<&Host> {
        self.cluster.iter().find(|h| h.name == name)
    }

    fn lock_params(&self) -> Result<MutexGuard<'_, ParamSet>> {
        self.params
            .lock()
            .map_err(|_| DomainError::poisoned("domain params"))
    }

    fn notify(&self, structural: bool) {
        let sink = &self.collaborators.sink;
        if structural {
            sink.notify_structural_change(&self.domain);
        } else {
            sink.notify_value_change(&self.domain);
        }
    }

    /// Snapshot every host, in cluster order. Unreachable hosts and
    /// provider failures yield `None`.
    async fn fetch_snapshots(&self) -> Vec<(String, Option<HostSnapshot>)> {
        let mut snapshots = Vec::with_capacity(self.cluster.len());
        for host in &self.cluster {
            let snapshot = if !host.connected {
                None
            } else {
                match self.collaborators.provider.snapshot(host, &self.domain).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(host = %host, domain = %self.domain, error = %e, "Snapshot failed");
                        None
                    }
                }
            };
            snapshots.push((host.name.clone(), snapshot));
        }
        snapshots
    }

    async fn refresh_aggregate(&self) -> Result<AggregateView> {
        let snapshots = self.fetch_snapshots().await;
        self.aggregate
            .recompute(snapshots.iter().map(|(h, s)| (h.as_str(), s.as_ref())))
    }

    async fn update_parameters_locked(&self) -> Result<bool> {
        if self.detached.load(Ordering::SeqCst) {
            debug!(domain = %self.domain, "Detached, skipping update");
            return Ok(false);
        }

        let snapshots = self.fetch_snapshots().await;
        self.aggregate
            .recompute(snapshots.iter().map(|(h, s)| (h.as_str(), s.as_ref())))?;

        let reported: Vec<&HostSnapshot> = snapshots
            .iter()
            .filter_map(|(_, s)| s.as_ref())
            .filter(|s| s.defined)
            .collect();
        if !reported.is_empty() {
            let mut merged = Params::new();
            for snapshot in &reported {
                for (name, value) in &snapshot.params {
                    if !value.is_empty() {
                        merged.entry(name.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
            self.lock_params()?.update_from_external(&merged);
        }

        let mut structural = false;
        let mut offset = 0;
        for store in &self.stores {
            let external =
                merge_external(store.category(), snapshots.iter().map(|(_, s)| s.as_ref()));
            let outcome = reconcile(store, &external, offset)?;
            structural |= outcome.changed();
            offset += store.len()?;
        }

        self.notify(structural);
        Ok(structural)
    }

    /// Record what `definition` carried as applied. Edits made while it was
    /// being written stay pending.
    fn mark_applied(&self, definition: &DesiredDefinition) -> Result<()> {
        let mut marked = 0;
        for store in &self.stores {
            marked += store.mark_applied(&definition.items)?;
        }
        self.lock_params()?.mark_saved_as(&definition.params);
        self.is_new.store(false, Ordering::SeqCst);
        debug!(domain = %self.domain, items = marked, "Definition marked applied");
        Ok(())
    }

    fn desired_definition(&self) -> Result<DesiredDefinition> {
        let (params, params_diff) = {
            let params = self.lock_params()?;
            (params.live().clone(), params.diff())
        };
        let mut items = Vec::new();
        for store in &self.stores {
            items.extend(store.items()?);
        }
        Ok(DesiredDefinition {
            params,
            params_diff,
            items,
        })
    }
}

#[async_trait]
impl StatusRefresher for DomainCore {
    async fn refresh_status(&self) {
        if let Err(e) = self.refresh_aggregate().await {
            error!(domain = %self.domain, error = %e, "Status refresh failed");
        }
    }

    async fn refresh_all(&self) {
        let _guard = self.status_lock.lock().await;
        if let Err(e) = self.update_parameters_locked().await {
            error!(domain = %self.domain, error = %e, "Refresh failed");
        }
    }
}
