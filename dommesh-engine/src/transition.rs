//! Lifecycle transitions and their bounded poll loops.
//!
//! A transition is requested per host, but polling is coalesced per
//! transition kind: while one poll job for `Starting` runs, further start
//! requests only add their host to the `starting` set and return at once.
//!
//! ```text
//!  request(start, h1) ──► command ──► admit ──► spawn poll job ──► await
//!  request(start, h2) ──► command ──► admit ──► (job active) ──► return
//!
//!  poll job: refresh ─► animate ─► set empty? ─► done
//!              ▲                       │ no
//!              └──────── sleep ◄───────┘ (up to action_timeout)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::DomainAggregateState;
use crate::error::{DomainError, Result};
use crate::traits::CommandFacade;
use crate::types::{CommandOptions, Host, LifecycleAction, PollSettings, TransitionKind};

/// Refreshes the state a poll job waits on.
#[async_trait]
pub trait StatusRefresher: Send + Sync + 'static {
    /// Pull fresh snapshots for every host and recompute the aggregate.
    async fn refresh_status(&self);

    /// Full refresh once a transition settled: status, hardware and repaint.
    async fn refresh_all(&self);
}

/// How a poll job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every host reached the target state.
    Converged { iterations: u32 },
    /// The iteration budget ran out; these hosts were still pending.
    TimedOut { pending: BTreeSet<String> },
    /// The job was cancelled before its hosts settled.
    Cancelled,
}

struct ActivePoll {
    token: CancellationToken,
    started_at: Instant,
}

/// Tracks the single active poll job per transition kind.
#[derive(Default)]
struct PollScheduler {
    active: Mutex<HashMap<TransitionKind, ActivePoll>>,
}

impl PollScheduler {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TransitionKind, ActivePoll>>> {
        self.active
            .lock()
            .map_err(|_| DomainError::poisoned("scheduler"))
    }
}

/// Issues lifecycle commands and waits for hosts to reach the target state.
pub struct TransitionController {
    aggregate: Arc<DomainAggregateState>,
    scheduler: Arc<PollScheduler>,
    settings: PollSettings,
}

impl TransitionController {
    /// Create a controller over a domain's aggregate state.
    pub fn new(aggregate: Arc<DomainAggregateState>, settings: PollSettings) -> Self {
        Self {
            aggregate,
            scheduler: Arc::new(PollScheduler::default()),
            settings,
        }
    }

    /// Poll settings in use.
    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Issue a lifecycle command and track the resulting transition.
    ///
    /// Returns false only when the command was rejected. The first request
    /// of a kind waits for its poll job (bounded by the action timeout);
    /// requests arriving while that job runs return immediately.
    #[instrument(skip(self, host, commands, options, refresher), fields(host = %host.name))]
    pub async fn request_transition(
        &self,
        action: LifecycleAction,
        host: &Host,
        domain: &str,
        commands: &dyn CommandFacade,
        options: &CommandOptions,
        refresher: Arc<dyn StatusRefresher>,
    ) -> bool {
        if let Err(e) = issue(commands, action, host, domain, options).await {
            warn!(action = %action, domain = %domain, error = %e, "Command rejected");
            return false;
        }
        info!(action = %action, domain = %domain, "Command accepted");

        let Some(kind) = action.transition() else {
            refresher.refresh_all().await;
            return true;
        };

        let token = match self.admit(kind, &host.name) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(kind = %kind, "Poller already active, host added to its set");
                return true;
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to admit transition");
                return true;
            }
        };

        let job = PollJob {
            kind,
            domain: domain.to_string(),
            aggregate: Arc::clone(&self.aggregate),
            scheduler: Arc::clone(&self.scheduler),
            settings: self.settings,
            token,
            refresher,
        };
        match tokio::spawn(job.run()).await {
            Ok(outcome) => debug!(kind = %kind, outcome = ?outcome, "Poll job finished"),
            Err(e) => error!(kind = %kind, error = %e, "Poll job failed"),
        }
        true
    }

    /// Add the host to its transition set and, if no job runs for the kind,
    /// register a new one. Both happen under the scheduler lock so a job
    /// that is about to finish cannot miss a late host.
    fn admit(&self, kind: TransitionKind, host: &str) -> Result<Option<CancellationToken>> {
        let mut active = self.scheduler.lock()?;
        self.aggregate.begin_transition(kind, host)?;
        if active.contains_key(&kind) {
            return Ok(None);
        }
        let token = CancellationToken::new();
        active.insert(
            kind,
            ActivePoll {
                token: token.clone(),
                started_at: Instant::now(),
            },
        );
        Ok(Some(token))
    }

    /// Number of poll jobs currently running.
    pub fn active_pollers(&self) -> usize {
        self.scheduler.lock().map(|active| active.len()).unwrap_or(0)
    }

    /// True while a poll job for the kind runs.
    pub fn is_polling(&self, kind: TransitionKind) -> bool {
        self.scheduler
            .lock()
            .map(|active| active.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Cancel one running poll job.
    pub fn cancel(&self, kind: TransitionKind) {
        if let Ok(active) = self.scheduler.lock() {
            if let Some(poll) = active.get(&kind) {
                poll.token.cancel();
            }
        }
    }

    /// Cancel every running poll job. Later requests start fresh jobs.
    pub fn shutdown(&self) {
        if let Ok(active) = self.scheduler.lock() {
            for poll in active.values() {
                poll.token.cancel();
            }
        }
    }
}

impl Drop for TransitionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn issue(
    commands: &dyn CommandFacade,
    action: LifecycleAction,
    host: &Host,
    domain: &str,
    options: &CommandOptions,
) -> Result<()> {
    match action {
        LifecycleAction::Start => commands.start(host, domain, options).await,
        LifecycleAction::Shutdown => commands.shutdown(host, domain, options).await,
        LifecycleAction::Reboot => commands.reboot(host, domain, options).await,
        LifecycleAction::Destroy => commands.destroy(host, domain, options).await,
        LifecycleAction::Suspend => commands.suspend(host, domain, options).await,
        LifecycleAction::Resume => commands.resume(host, domain, options).await,
    }
}

struct PollJob {
    kind: TransitionKind,
    domain: String,
    aggregate: Arc<DomainAggregateState>,
    scheduler: Arc<PollScheduler>,
    settings: PollSettings,
    token: CancellationToken,
    refresher: Arc<dyn StatusRefresher>,
}

impl PollJob {
    async fn run(self) -> PollOutcome {
        let outcome = self.poll().await;

        match &outcome {
            PollOutcome::Converged { iterations } => {
                info!(domain = %self.domain, kind = %self.kind, iterations, "Transition completed");
            }
            PollOutcome::TimedOut { pending } => {
                warn!(
                    domain = %self.domain,
                    kind = %self.kind,
                    pending = ?pending,
                    "Transition timed out, no longer waiting"
                );
            }
            PollOutcome::Cancelled => {
                info!(domain = %self.domain, kind = %self.kind, "Transition polling cancelled");
                return outcome;
            }
        }

        self.refresher.refresh_all().await;
        outcome
    }

    async fn poll(&self) -> PollOutcome {
        for iteration in 1..=self.settings.action_timeout {
            if iteration > 1 {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        self.finish();
                        return PollOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(self.settings.interval) => {}
                }
            } else if self.token.is_cancelled() {
                self.finish();
                return PollOutcome::Cancelled;
            }

            self.refresher.refresh_status().await;
            if let Err(e) = self.aggregate.advance_animation() {
                error!(error = %e, "Failed to advance animation");
            }

            match self.try_complete() {
                Ok(true) => return PollOutcome::Converged { iterations: iteration },
                Ok(false) => debug!(kind = %self.kind, iteration, "Transition pending"),
                Err(e) => {
                    error!(kind = %self.kind, error = %e, "Poll job lost its state");
                    return PollOutcome::TimedOut { pending: self.finish() };
                }
            }
        }

        PollOutcome::TimedOut {
            pending: self.finish(),
        }
    }

    /// Unregister the job if its set drained.
    fn try_complete(&self) -> Result<bool> {
        let mut active = self.scheduler.lock()?;
        if !self.aggregate.transition_is_empty(self.kind)? {
            return Ok(false);
        }
        if let Some(poll) = active.remove(&self.kind) {
            let elapsed_ms = poll.started_at.elapsed().as_millis() as u64;
            debug!(kind = %self.kind, elapsed_ms, "Poller released");
        }
        Ok(true)
    }

    /// Clear the transition set and unregister the job.
    fn finish(&self) -> BTreeSet<String> {
        let mut active = match self.scheduler.lock() {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Failed to release poller");
                return BTreeSet::new();
            }
        };
        active.remove(&self.kind);
        self.aggregate
            .clear_transition(self.kind)
            .unwrap_or_default()
    }
}
