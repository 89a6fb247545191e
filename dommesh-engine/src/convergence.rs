//! Multi-host convergence of a domain definition ("apply").

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::{DomainError, Result};
use crate::hardware::HardwareItem;
use crate::traits::CommandFacade;
use crate::types::{ApplyReport, CommandOptions, DeviceUpdate, Host, Params, RunMode};

/// What a convergence pass does on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    /// Write a full definition.
    Create,
    /// Write the diff into the existing definition.
    Modify,
    /// Desired and defined, nothing to write.
    Unchanged,
    /// Remove the definition.
    Undefine,
    /// Neither desired nor defined.
    Skip,
}

/// Decide the action for every host of the cluster.
///
/// A host outside `desired` never receives a create or modify, only an
/// undefine when the domain is currently defined there.
pub fn plan(
    cluster: &[Host],
    defined_on: &BTreeSet<String>,
    desired: &BTreeSet<String>,
    domain_is_new: bool,
    has_changes: bool,
) -> Vec<(Host, HostAction)> {
    cluster
        .iter()
        .map(|host| {
            let defined = defined_on.contains(&host.name);
            let action = if desired.contains(&host.name) {
                if domain_is_new || !defined {
                    HostAction::Create
                } else if has_changes {
                    HostAction::Modify
                } else {
                    HostAction::Unchanged
                }
            } else if defined {
                HostAction::Undefine
            } else {
                HostAction::Skip
            };
            (host.clone(), action)
        })
        .collect()
}

/// The locally edited configuration to push to the hosts.
#[derive(Debug, Clone, Default)]
pub struct DesiredDefinition {
    /// Full domain-level parameters
    pub params: Params,
    /// Domain-level parameters changed since the last apply
    pub params_diff: Params,
    /// Every hardware item, in global order
    pub items: Vec<HardwareItem>,
}

impl DesiredDefinition {
    /// True when anything must be written to an existing definition.
    pub fn has_changes(&self) -> bool {
        !self.params_diff.is_empty() || self.items.iter().any(HardwareItem::is_changed)
    }

    /// Check the items before they are pushed.
    ///
    /// Items reported by hosts are only checked in a simulated pass.
    pub fn validate(&self, mode: RunMode) -> Result<()> {
        self.items
            .iter()
            .filter(|item| mode == RunMode::Simulate || item.is_changed())
            .try_for_each(HardwareItem::validate)
    }
}

/// Pushes a desired definition to the hosts of a cluster.
pub struct ConvergenceEngine<'a> {
    commands: &'a dyn CommandFacade,
    options: CommandOptions,
}

impl<'a> ConvergenceEngine<'a> {
    pub fn new(commands: &'a dyn CommandFacade) -> Self {
        Self {
            commands,
            options: CommandOptions::default(),
        }
    }

    /// Use these options for undefine calls.
    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one convergence pass.
    ///
    /// Host failures are recorded in the report and do not stop the pass;
    /// whatever was written to other hosts stays.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn converge(
        &self,
        domain: &str,
        cluster: &[Host],
        defined_on: &BTreeSet<String>,
        desired: &BTreeSet<String>,
        domain_is_new: bool,
        definition: &DesiredDefinition,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let actions = plan(
            cluster,
            defined_on,
            desired,
            domain_is_new,
            definition.has_changes(),
        );

        for (host, action) in actions {
            if !host.connected && action != HostAction::Skip {
                warn!(host = %host, action = ?action, "Host unreachable, skipped");
                let error = DomainError::HostUnreachable(host.name.clone());
                report.failed.push((host.name.clone(), error.to_string()));
                continue;
            }

            let result = match action {
                HostAction::Create => self
                    .create(&host, domain, definition)
                    .await
                    .map(|_| report.created.insert(host.name.clone())),
                HostAction::Modify => self
                    .modify(&host, domain, definition)
                    .await
                    .map(|_| report.modified.insert(host.name.clone())),
                HostAction::Undefine => self
                    .commands
                    .undefine(&host, domain, &self.options)
                    .await
                    .map(|_| report.undefined.insert(host.name.clone())),
                HostAction::Unchanged => {
                    report.unchanged.insert(host.name.clone());
                    Ok(true)
                }
                HostAction::Skip => Ok(false),
            };

            if let Err(e) = result {
                warn!(host = %host, action = ?action, error = %e, "Convergence failed on host");
                report.failed.push((host.name.clone(), e.to_string()));
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            created = report.created.len(),
            modified = report.modified.len(),
            undefined = report.undefined.len(),
            failed = report.failed.len(),
            "Convergence pass finished"
        );
        report
    }

    /// Define the domain on a host with the full parameter set of every item.
    async fn create(
        &self,
        host: &Host,
        domain: &str,
        definition: &DesiredDefinition,
    ) -> Result<()> {
        debug!(host = %host, "Creating definition");
        let handle = self
            .commands
            .define_or_modify(host, domain, &definition.params)
            .await?;

        for item in &definition.items {
            let update = DeviceUpdate {
                category: item.category,
                key: item.key.clone(),
                params: item.params().clone(),
                is_new: true,
            };
            self.commands.modify_device(&handle, &update).await?;
        }

        self.commands.save(&handle).await
    }

    /// Write only what changed since the last apply.
    async fn modify(
        &self,
        host: &Host,
        domain: &str,
        definition: &DesiredDefinition,
    ) -> Result<()> {
        debug!(host = %host, "Modifying definition");
        let handle = self
            .commands
            .define_or_modify(host, domain, &definition.params_diff)
            .await?;

        for item in definition.items.iter().filter(|item| item.is_changed()) {
            let params = if item.is_new {
                item.params().clone()
            } else {
                item.diff()
            };
            let update = DeviceUpdate {
                category: item.category,
                key: item.key.clone(),
                params,
                is_new: item.is_new,
            };
            self.commands.modify_device(&handle, &update).await?;
        }

        self.commands.save(&handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn cluster() -> Vec<Host> {
        vec![Host::new("h1"), Host::new("h2"), Host::new("h3")]
    }

    #[test]
    fn test_plan_moves_definition() {
        let actions = plan(&cluster(), &set(&["h1", "h2"]), &set(&["h1", "h3"]), false, true);
        let actions: Vec<HostAction> = actions.into_iter().map(|(_, a)| a).collect();
        assert_eq!(
            actions,
            vec![HostAction::Modify, HostAction::Undefine, HostAction::Create]
        );
    }

    #[test]
    fn test_plan_new_domain_creates_everywhere_desired() {
        let actions = plan(&cluster(), &set(&[]), &set(&["h2"]), true, true);
        let actions: Vec<HostAction> = actions.into_iter().map(|(_, a)| a).collect();
        assert_eq!(
            actions,
            vec![HostAction::Skip, HostAction::Create, HostAction::Skip]
        );
    }

    #[test]
    fn test_plan_without_changes() {
        let actions = plan(&cluster(), &set(&["h1"]), &set(&["h1"]), false, false);
        assert_eq!(actions[0].1, HostAction::Unchanged);
        assert_eq!(actions[1].1, HostAction::Skip);
    }
}
