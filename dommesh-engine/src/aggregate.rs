//! Per-domain aggregate of the hosts' power states and in-flight transitions.

use std::collections::BTreeSet;
use std::sync::RwLock;

use serde::Serialize;
use tracing::debug;

use crate::error::{DomainError, Result};
use crate::types::{HostPowerState, HostSnapshot, TransitionKind};

const ANIMATION_FRAMES: [char; 4] = ['-', '\\', '|', '/'];

/// Consistent copy of a domain's aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateView {
    pub defined_on: BTreeSet<String>,
    pub running_on: BTreeSet<String>,
    /// Always a subset of `running_on`
    pub suspended_on: BTreeSet<String>,
    pub starting: BTreeSet<String>,
    pub shutting_down: BTreeSet<String>,
    pub suspending: BTreeSet<String>,
    pub resuming: BTreeSet<String>,
    pub anim_frame: char,
}

impl Default for AggregateView {
    fn default() -> Self {
        Self {
            defined_on: BTreeSet::new(),
            running_on: BTreeSet::new(),
            suspended_on: BTreeSet::new(),
            starting: BTreeSet::new(),
            shutting_down: BTreeSet::new(),
            suspending: BTreeSet::new(),
            resuming: BTreeSet::new(),
            anim_frame: ANIMATION_FRAMES[0],
        }
    }
}

impl AggregateView {
    /// Hosts currently in the given transition.
    pub fn transition_set(&self, kind: TransitionKind) -> &BTreeSet<String> {
        match kind {
            TransitionKind::Starting => &self.starting,
            TransitionKind::ShuttingDown => &self.shutting_down,
            TransitionKind::Suspending => &self.suspending,
            TransitionKind::Resuming => &self.resuming,
        }
    }

    fn transition_set_mut(&mut self, kind: TransitionKind) -> &mut BTreeSet<String> {
        match kind {
            TransitionKind::Starting => &mut self.starting,
            TransitionKind::ShuttingDown => &mut self.shutting_down,
            TransitionKind::Suspending => &mut self.suspending,
            TransitionKind::Resuming => &mut self.resuming,
        }
    }

    /// True while any host is in a transition.
    pub fn in_transition(&self) -> bool {
        TransitionKind::ALL
            .iter()
            .any(|kind| !self.transition_set(*kind).is_empty())
    }

    /// Power state of the domain on one host.
    pub fn power_state(&self, host: &str) -> HostPowerState {
        if self.starting.contains(host) {
            HostPowerState::Starting
        } else if self.shutting_down.contains(host) {
            HostPowerState::ShuttingDown
        } else if self.suspending.contains(host) {
            HostPowerState::Suspending
        } else if self.resuming.contains(host) {
            HostPowerState::Resuming
        } else if self.suspended_on.contains(host) {
            HostPowerState::Suspended
        } else if self.running_on.contains(host) {
            HostPowerState::Running
        } else if self.defined_on.contains(host) {
            HostPowerState::Stopped
        } else {
            HostPowerState::Undefined
        }
    }

    /// Short human readable status line.
    pub fn summary(&self) -> String {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");

        let mut parts = Vec::new();
        for kind in TransitionKind::ALL {
            let set = self.transition_set(kind);
            if !set.is_empty() {
                parts.push(format!("{} on {}", kind, join(set)));
            }
        }

        let running: BTreeSet<String> = self
            .running_on
            .difference(&self.suspended_on)
            .cloned()
            .collect();
        if !running.is_empty() {
            parts.push(format!("running on {}", join(&running)));
        }
        if !self.suspended_on.is_empty() {
            parts.push(format!("suspended on {}", join(&self.suspended_on)));
        }

        let mut summary = if !parts.is_empty() {
            parts.join("; ")
        } else if self.defined_on.is_empty() {
            "not defined".to_string()
        } else {
            "stopped".to_string()
        };
        if self.in_transition() {
            summary.push(' ');
            summary.push(self.anim_frame);
        }
        summary
    }
}

/// Aggregate state of one domain across the cluster.
///
/// Every field is written together under one write lock, so readers never
/// see a transition set updated without the matching running set.
#[derive(Debug, Default)]
pub struct DomainAggregateState {
    state: RwLock<AggregateView>,
}

impl DomainAggregateState {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the current state.
    pub fn view(&self) -> Result<AggregateView> {
        self.state
            .read()
            .map(|state| state.clone())
            .map_err(|_| DomainError::poisoned("aggregate"))
    }

    /// Power state of the domain on one host.
    pub fn power_state(&self, host: &str) -> Result<HostPowerState> {
        Ok(self.view()?.power_state(host))
    }

    /// Rebuild the host sets from fresh snapshots.
    ///
    /// Hosts without a snapshot keep their previous membership. A host leaves
    /// a transition set once its snapshot shows the transition's target state.
    pub fn recompute<'a, I>(&self, snapshots: I) -> Result<AggregateView>
    where
        I: IntoIterator<Item = (&'a str, Option<&'a HostSnapshot>)>,
    {
        let mut state = self
            .state
            .write()
            .map_err(|_| DomainError::poisoned("aggregate"))?;

        for (host, snapshot) in snapshots {
            let Some(snapshot) = snapshot else {
                continue;
            };
            set_membership(&mut state.defined_on, host, snapshot.defined);
            let running = snapshot.defined && (snapshot.running || snapshot.suspended);
            set_membership(&mut state.running_on, host, running);
            set_membership(&mut state.suspended_on, host, running && snapshot.suspended);

            if running {
                state.starting.remove(host);
            } else {
                state.shutting_down.remove(host);
            }
            if running && snapshot.suspended {
                state.suspending.remove(host);
            } else {
                state.resuming.remove(host);
            }
        }

        Ok(state.clone())
    }

    /// Put a host into a transition set.
    ///
    /// The host leaves every other transition set. Returns true when the set
    /// was empty before.
    pub fn begin_transition(&self, kind: TransitionKind, host: &str) -> Result<bool> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DomainError::poisoned("aggregate"))?;
        for other in TransitionKind::ALL {
            if other != kind {
                state.transition_set_mut(other).remove(host);
            }
        }
        let set = state.transition_set_mut(kind);
        let was_empty = set.is_empty();
        set.insert(host.to_string());
        debug!(kind = %kind, host = %host, was_empty, "Host entered transition");
        Ok(was_empty)
    }

    /// True when no host is in the given transition.
    pub fn transition_is_empty(&self, kind: TransitionKind) -> Result<bool> {
        Ok(self.view()?.transition_set(kind).is_empty())
    }

    /// Empty a transition set and return the hosts that were still in it.
    pub fn clear_transition(&self, kind: TransitionKind) -> Result<BTreeSet<String>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DomainError::poisoned("aggregate"))?;
        Ok(std::mem::take(state.transition_set_mut(kind)))
    }

    /// Step the shared animation frame and return the new one.
    pub fn advance_animation(&self) -> Result<char> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DomainError::poisoned("aggregate"))?;
        let current = ANIMATION_FRAMES
            .iter()
            .position(|frame| *frame == state.anim_frame)
            .unwrap_or(0);
        state.anim_frame = ANIMATION_FRAMES[(current + 1) % ANIMATION_FRAMES.len()];
        Ok(state.anim_frame)
    }
}

fn set_membership(set: &mut BTreeSet<String>, host: &str, member: bool) {
    if member {
        set.insert(host.to_string());
    } else {
        set.remove(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> HostSnapshot {
        HostSnapshot {
            defined: true,
            running: true,
            ..Default::default()
        }
    }

    fn suspended() -> HostSnapshot {
        HostSnapshot {
            defined: true,
            running: true,
            suspended: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_recompute_sets() {
        let aggregate = DomainAggregateState::new();
        let stopped = HostSnapshot::defined();
        let h1 = running();
        let h3 = suspended();

        let view = aggregate
            .recompute(vec![("h1", Some(&h1)), ("h2", Some(&stopped)), ("h3", Some(&h3))])
            .unwrap();
        assert_eq!(view.defined_on.len(), 3);
        assert_eq!(view.running_on.len(), 2);
        assert!(view.suspended_on.is_subset(&view.running_on));
        assert_eq!(view.power_state("h2"), HostPowerState::Stopped);
        assert_eq!(view.power_state("h3"), HostPowerState::Suspended);
        assert_eq!(view.power_state("h9"), HostPowerState::Undefined);
    }

    #[test]
    fn test_unreachable_host_keeps_membership() {
        let aggregate = DomainAggregateState::new();
        let h1 = running();
        aggregate.recompute(vec![("h1", Some(&h1))]).unwrap();
        let view = aggregate.recompute(vec![("h1", None)]).unwrap();
        assert!(view.running_on.contains("h1"));
    }

    #[test]
    fn test_transition_leaves_set_when_observed() {
        let aggregate = DomainAggregateState::new();
        assert!(aggregate.begin_transition(TransitionKind::Starting, "h1").unwrap());
        assert!(!aggregate.begin_transition(TransitionKind::Starting, "h2").unwrap());
        assert_eq!(aggregate.power_state("h1").unwrap(), HostPowerState::Starting);

        let h1 = running();
        let stopped = HostSnapshot::defined();
        let view = aggregate
            .recompute(vec![("h1", Some(&h1)), ("h2", Some(&stopped))])
            .unwrap();
        assert_eq!(view.starting.iter().collect::<Vec<_>>(), vec!["h2"]);
        assert_eq!(view.power_state("h1"), HostPowerState::Running);
    }

    #[test]
    fn test_host_is_in_one_transition_at_a_time() {
        let aggregate = DomainAggregateState::new();
        aggregate.begin_transition(TransitionKind::Suspending, "h1").unwrap();
        aggregate.begin_transition(TransitionKind::ShuttingDown, "h1").unwrap();
        let view = aggregate.view().unwrap();
        assert!(view.suspending.is_empty());
        assert!(view.shutting_down.contains("h1"));
    }

    #[test]
    fn test_clear_transition_returns_pending() {
        let aggregate = DomainAggregateState::new();
        aggregate.begin_transition(TransitionKind::Resuming, "h1").unwrap();
        let pending = aggregate.clear_transition(TransitionKind::Resuming).unwrap();
        assert!(pending.contains("h1"));
        assert!(aggregate.transition_is_empty(TransitionKind::Resuming).unwrap());
    }

    #[test]
    fn test_animation_cycles() {
        let aggregate = DomainAggregateState::new();
        let frames: Vec<char> = (0..4).map(|_| aggregate.advance_animation().unwrap()).collect();
        assert_eq!(frames, vec!['\\', '|', '/', '-']);
    }

    #[test]
    fn test_summary() {
        let aggregate = DomainAggregateState::new();
        assert_eq!(aggregate.view().unwrap().summary(), "not defined");

        let h1 = running();
        let h2 = HostSnapshot::defined();
        aggregate
            .recompute(vec![("h1", Some(&h1)), ("h2", Some(&h2))])
            .unwrap();
        assert_eq!(aggregate.view().unwrap().summary(), "running on h1");

        aggregate.begin_transition(TransitionKind::Starting, "h2").unwrap();
        assert_eq!(
            aggregate.view().unwrap().summary(),
            "starting on h2; running on h1 -"
        );
    }
}
