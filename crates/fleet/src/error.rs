//! # Error Taxonomy
//!
//! Two error families, split by how far they propagate:
//!
//! | Type | Scope | Handling |
//! |------|-------|----------|
//! | [`FleetError`] | whole operation (pre-flight) | unwinds to the caller, nothing persisted |
//! | [`NodeError`] | one node inside the executor | converted into an `ExecutionResult` |
//!
//! An operation that returns a `FleetError` made no remote call. Local
//! writes that fail once remote work has run (fleet file, output files)
//! travel in `LifecycleOutcome::local_error` next to the full report. A
//! `NodeError` never escapes a worker.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::identity::IdentityError;
use crate::manifest::ManifestError;
use crate::transport::TransportError;

// ════════════════════════════════════════════════════════════════════════════════
// FATAL / PRE-FLIGHT
// ════════════════════════════════════════════════════════════════════════════════

/// Errors that abort an entire lifecycle operation.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The fleet configuration is structurally invalid.
    #[error("invalid fleet configuration: {0}")]
    Config(String),

    /// Two nodes share the same name.
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    /// More than one node has the bootnode role.
    #[error("multiple bootnodes configured: '{0}' and '{1}'")]
    MultipleBootnodes(String, String),

    /// No node has the bootnode role, so peer addresses cannot be built.
    #[error("no bootnode configured: one node must have role 'bootnode'")]
    MissingBootnode,

    /// A node needed by the topology has no identity yet.
    #[error("node '{0}' has no identity: run install or genesis first")]
    IncompleteIdentity(String),

    /// Referenced node does not exist in the configuration.
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// Identity generation or loading failed for a node.
    #[error("identity for node '{node}' failed: {source}")]
    Identity {
        node: String,
        #[source]
        source: IdentityError,
    },

    /// The genesis template is unusable.
    #[error("genesis template error: {0}")]
    Template(String),

    /// Manifest could not be rendered or written.
    #[error("manifest for node '{node}' failed: {source}")]
    Manifest {
        node: String,
        #[source]
        source: ManifestError,
    },

    /// Local filesystem failure.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON (de)serialization failure of a local file.
    #[error("malformed JSON in '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl FleetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FleetError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        FleetError::Json {
            path: path.into(),
            source,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PER-NODE
// ════════════════════════════════════════════════════════════════════════════════

/// Failure of one node's action. Always captured into the fleet report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Host unreachable or connection dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Credentials rejected by the host.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A remote command exited non-zero.
    #[error("remote command `{command}` exited with {code}: {stderr}")]
    RemoteExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// File transfer to or from the host failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// A remote call exceeded its timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A local input required by the action is missing.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A derived artifact (e.g. a prior manifest) is missing or malformed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// A query succeeded but returned nothing usable.
    #[error("empty response: {0}")]
    EmptyResponse(String),

    /// The node's service is not in the running state.
    #[error("service not running (state: {0})")]
    NotRunning(String),

    /// The action was never started because the operation was cancelled.
    #[error("cancelled before start")]
    Cancelled,

    /// The action panicked; the panic was contained to this node.
    #[error("action panicked: {0}")]
    Panicked(String),
}

impl From<TransportError> for NodeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connection(msg) => NodeError::Connection(msg),
            TransportError::Authentication(msg) => NodeError::Authentication(msg),
            TransportError::Timeout { operation, secs } => {
                NodeError::Timeout(format!("{} after {}s", operation, secs))
            }
            TransportError::Transfer(msg) => NodeError::Transfer(msg),
            TransportError::Io(msg) => NodeError::Connection(msg),
        }
    }
}

impl From<ManifestError> for NodeError {
    fn from(e: ManifestError) -> Self {
        NodeError::Artifact(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_node_taxonomy() {
        let auth: NodeError = TransportError::Authentication("denied".into()).into();
        assert_eq!(auth, NodeError::Authentication("denied".into()));

        let timeout: NodeError = TransportError::Timeout {
            operation: "execute".into(),
            secs: 30,
        }
        .into();
        assert_eq!(timeout.to_string(), "timed out: execute after 30s");
    }

    #[test]
    fn remote_exit_display_names_command() {
        let err = NodeError::RemoteExit {
            command: "docker pull x".into(),
            code: 1,
            stderr: "manifest unknown".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docker pull x"));
        assert!(msg.contains("manifest unknown"));
    }

    #[test]
    fn fleet_error_display_names_node() {
        let err = FleetError::IncompleteIdentity("val-2".into());
        assert!(err.to_string().contains("val-2"));
    }
}
