//! # dommesh Engine
//!
//! Reconciliation and lifecycle engine for virtual machine definitions
//! ("domains") spread over a cluster of hosts.
//!
//! For each domain the engine keeps:
//! - **Hardware tree** - nine keyed category stores (disk, filesystem,
//!   interface, input, graphics, sound, serial, parallel, video) reconciled
//!   against what the hosts report
//! - **Aggregate state** - where the domain is defined, running or suspended,
//!   and which hosts are in a lifecycle transition
//! - **Convergence** - pushing the locally edited definition to the hosts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           DomainOrchestrator            │
//! │ (update_parameters, apply, start, ...)  │
//! └──────┬──────────────┬──────────────┬────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌─────────────┐ ┌──────────────┐ ┌─────────────────┐
//! │ Category    │ │ Transition   │ │ Convergence     │
//! │ stores +    │ │ controller + │ │ engine          │
//! │ reconciler  │ │ aggregate    │ │                 │
//! └─────────────┘ └──────────────┘ └─────────────────┘
//!        ▲              │              │
//!        │              ▼              ▼
//! ┌─────────────────────────────────────────┐
//! │  SnapshotProvider / CommandFacade       │
//! │  (MockCluster for tests and the daemon) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dommesh_engine::{Collaborators, DomainOrchestrator, Host, MockCluster, NullSink, PollSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = Arc::new(MockCluster::new());
//!     let orchestrator = DomainOrchestrator::new(
//!         "web",
//!         vec![Host::new("h1"), Host::new("h2")],
//!         Collaborators::from_backend(cluster, Arc::new(NullSink)),
//!         PollSettings::default(),
//!     );
//!
//!     orchestrator.update_parameters().await.unwrap();
//!     orchestrator.start("h1").await;
//! }
//! ```

pub mod aggregate;
pub mod convergence;
pub mod error;
pub mod hardware;
pub mod mock;
pub mod orchestrator;
pub mod reconcile;
pub mod store;
pub mod traits;
pub mod transition;
pub mod types;

pub use aggregate::{AggregateView, DomainAggregateState};
pub use convergence::{ConvergenceEngine, DesiredDefinition, HostAction};
pub use error::{DomainError, Result};
pub use hardware::{CategoryDescriptor, HardwareCategory, HardwareItem, ParamSet, GENERATE};
pub use mock::{MockCluster, RecordingSink};
pub use orchestrator::{Collaborators, DomainOrchestrator};
pub use reconcile::{merge_external, reconcile, ReconcileOutcome};
pub use store::CategoryStore;
pub use traits::{CommandFacade, NullSink, PresentationSink, SnapshotProvider};
pub use transition::{PollOutcome, StatusRefresher, TransitionController};
pub use types::*;
