//! Error types for Pelagicontain.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::container::{ExitOutcome, Phase};
use crate::orchestrator::LifecycleState;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Shared workspace could not be prepared
    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Runtime command construction failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Container(#[from] ContainerError),

    /// Runtime phase execution or supervision failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),

    /// Gateway configuration or activation failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    /// Lifecycle operation called out of order
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Controller or registration authority call failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(pelagicontain::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(pelagicontain::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while bootstrapping the shared workspace directory.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// Workspace root is missing and could not be created
    #[error("Failed to initialize workspace root {}", .path.display())]
    #[diagnostic(
        code(pelagicontain::workspace::init),
        help("Check that the parent directory exists and is writable")
    )]
    InitFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from building the runtime phase commands.
#[derive(Error, Debug, Diagnostic)]
pub enum ContainerError {
    /// Contained command is empty
    #[error("Contained command for container {container} is empty")]
    #[diagnostic(code(pelagicontain::container::empty_command))]
    EmptyCommand { container: String },

    /// Generated command exceeds the runtime's command length limit
    #[error(
        "{phase} command for container {container} is {length} bytes, limit is {limit}"
    )]
    #[diagnostic(
        code(pelagicontain::container::command_too_long),
        help("Shorten the contained command or raise max_command_length")
    )]
    CommandTooLong {
        container: String,
        phase: Phase,
        length: usize,
        limit: usize,
    },
}

/// Errors from running or supervising runtime processes.
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Process could not be spawned
    #[error("Failed to spawn {phase} phase for container {container}")]
    #[diagnostic(code(pelagicontain::runtime::spawn))]
    Spawn {
        container: String,
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    /// Phase command ran but did not succeed
    #[error("{phase} phase for container {container} failed: {outcome}")]
    #[diagnostic(code(pelagicontain::runtime::phase_failed))]
    PhaseFailed {
        container: String,
        phase: Phase,
        outcome: ExitOutcome,
    },

    /// Phase did not finish within the configured timeout
    #[error("{phase} phase for container {container} timed out after {timeout_ms}ms")]
    #[diagnostic(code(pelagicontain::runtime::timeout))]
    Timeout {
        container: String,
        phase: Phase,
        timeout_ms: u128,
    },

    /// Waiting on a child process failed
    #[error("Failed to wait for {phase} phase of container {container}")]
    #[diagnostic(code(pelagicontain::runtime::wait))]
    Wait {
        container: String,
        phase: Phase,
        #[source]
        source: std::io::Error,
    },
}

/// A single gateway failure, as collected by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    /// Identifier of the gateway that failed.
    pub gateway: String,
    /// Rendered error message.
    pub reason: String,
}

impl std::fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.gateway, self.reason)
    }
}

/// Errors reported by gateways.
#[derive(Error, Debug, Diagnostic)]
pub enum GatewayError {
    /// Configuration payload rejected by the gateway
    #[error("Invalid configuration for gateway {id}: {reason}")]
    #[diagnostic(code(pelagicontain::gateway::invalid_config))]
    InvalidConfig { id: String, reason: String },

    /// Gateway could not be activated
    #[error("Failed to activate gateway {id}: {reason}")]
    #[diagnostic(code(pelagicontain::gateway::activation))]
    ActivationFailed { id: String, reason: String },

    /// Gateway could not be torn down cleanly
    #[error("Failed to tear down gateway {id}: {reason}")]
    #[diagnostic(code(pelagicontain::gateway::teardown))]
    TeardownFailed { id: String, reason: String },

    /// Filesystem or process operation inside a gateway failed
    #[error("Gateway {id}: {context}")]
    #[diagnostic(code(pelagicontain::gateway::io))]
    Io {
        id: String,
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// One or more gateways failed under the strict activation policy
    #[error("{} gateway(s) failed to activate for container {container}", .failures.len())]
    #[diagnostic(
        code(pelagicontain::gateway::strict),
        help("Use the best-effort activation policy to start the application regardless")
    )]
    Activation {
        container: String,
        failures: Vec<GatewayFailure>,
    },
}

/// Lifecycle operations invoked in the wrong order.
#[derive(Error, Debug, Diagnostic)]
pub enum LifecycleError {
    /// Operation is not valid in the current state
    #[error("Cannot {operation} while orchestrator is {state}")]
    #[diagnostic(
        code(pelagicontain::lifecycle::order),
        help("Lifecycle order is initialize, run, launch, update, shutdown")
    )]
    OrderViolation {
        operation: &'static str,
        state: LifecycleState,
    },
}

/// Failures delivering calls to external collaborators.
#[derive(Error, Debug, Diagnostic)]
pub enum CollaboratorError {
    /// Controller call could not be delivered
    #[error("Controller {call} failed: {reason}")]
    #[diagnostic(code(pelagicontain::controller))]
    Controller { call: &'static str, reason: String },

    /// Registration authority call could not be delivered
    #[error("Registration authority {call} failed: {reason}")]
    #[diagnostic(code(pelagicontain::authority))]
    Authority { call: &'static str, reason: String },
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Runtime program missing
    #[error("Container runtime program {program} was not found")]
    #[diagnostic(
        code(pelagicontain::system::program_not_found),
        help("Install the LXC userspace tools or point the runtime settings at them")
    )]
    ProgramNotFound { program: String },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_too_long_names_phase_and_limit() {
        let err = ContainerError::CommandTooLong {
            container: "pelagicontain-abc".to_string(),
            phase: Phase::Execute,
            length: 5000,
            limit: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("execute"));
        assert!(msg.contains("pelagicontain-abc"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_order_violation_message() {
        let err = LifecycleError::OrderViolation {
            operation: "update",
            state: LifecycleState::Initialized,
        };
        assert_eq!(err.to_string(), "Cannot update while orchestrator is initialized");
    }

    #[test]
    fn test_strict_activation_counts_failures() {
        let err = GatewayError::Activation {
            container: "c".to_string(),
            failures: vec![
                GatewayFailure {
                    gateway: "network".to_string(),
                    reason: "boom".to_string(),
                },
                GatewayFailure {
                    gateway: "pulseaudio".to_string(),
                    reason: "boom".to_string(),
                },
            ],
        };
        assert!(err.to_string().starts_with("2 gateway(s)"));
    }

    #[test]
    fn test_top_level_from_conversion() {
        let err: Error = WorkspaceError::InitFailed {
            path: PathBuf::from("/nope"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .into();
        assert!(matches!(err, Error::Workspace(_)));
        assert!(err.to_string().contains("/nope"));
    }
}
