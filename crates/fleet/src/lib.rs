//! # fleet-core
//!
//! Provisioning and lifecycle orchestration for a fleet of ledger nodes
//! spread over many hosts.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`model`] | `NodeSpec`, roles, identities, fleet validation |
//! | [`identity`] | per-node BLS + Ed25519 keys, generated at most once |
//! | [`genesis`] | genesis document, static peers, validator roster |
//! | [`manifest`] | per-node compose manifest, install and update variants |
//! | [`executor`] | bounded-parallel per-node runner with isolated failures |
//! | [`lifecycle`] | install, update, start, stop, remove, status and friends |
//! | [`transport`] | remote execute/upload seam (ssh and mock) |
//! | [`store`] | JSON configuration store with atomic save |
//! | [`plan`] | fleet layout from a hosts list |
//!
//! ## Control Flow
//!
//! ```text
//! FleetController
//!   → IdentityGenerator → genesis::build → manifest::render
//!   → FleetExecutor (per-node actions over RemoteTransport)
//!   → FleetReport
//! ```

pub mod actions;
pub mod config;
pub mod error;
pub mod executor;
pub mod genesis;
pub mod identity;
pub mod lifecycle;
pub mod manifest;
pub mod model;
pub mod plan;
pub mod report;
pub mod store;
pub mod transport;

pub use config::ClusterConfig;
pub use error::{FleetError, NodeError};
pub use executor::{run_all, CancelToken, FleetExecutor};
pub use genesis::{GenesisTemplate, Topology};
pub use identity::{DefaultKeyGenerator, IdentityGenerator, KeyGenerator};
pub use lifecycle::{FleetController, LifecycleOutcome, Operation};
pub use model::{Credential, Identity, NodeSpec, Role, StakingSpec};
pub use report::{ExecutionResult, FleetReport};
pub use store::ConfigStore;
pub use transport::{MockTransport, RemoteTransport, SshTransport};
