//! Container lifecycle orchestration.
//!
//! The [`Orchestrator`] owns one container, its gateways and the supervised
//! runtime child, and sequences them through a fixed lifecycle:
//!
//! ```text
//! New --initialize--> Initialized --run--> Running --launch--> Launched
//!                                             |                  |
//!                                             |      +--update---+
//!                                             |      v           |
//!                                             |   Updated --update--> Updated
//!                                             |      |           |
//!                                             +------+--shutdown-+
//!                                                    v
//!                                      ShuttingDown --> Terminated
//! ```
//!
//! Shutdown from `Running` cleans up after a failed `launch`.
//!
//! Every operation checks the current state first and fails with
//! `LifecycleError::OrderViolation` without side effects when called out of
//! order.

mod collaborators;
mod config;
mod lifecycle;

pub use collaborators::{
    CONTROLLER_FIFO, Controller, FifoController, LoggingAuthority, RegistrationAuthority,
};
pub use config::{ActivationPolicy, DEFAULT_MAX_COMMAND_LENGTH, OrchestratorConfig};
pub use lifecycle::Orchestrator;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::container::ExitOutcome;
use crate::error::GatewayFailure;

/// Where the orchestrator is in the container lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    /// Constructed, nothing prepared.
    #[default]
    New,
    /// Workspace checked, container and gateways created.
    Initialized,
    /// Create phase done, supervised child running.
    Running,
    /// Application registered with the authority.
    Launched,
    /// Gateways configured and activated at least once.
    Updated,
    /// Shutdown in progress.
    ShuttingDown,
    /// Shutdown complete; terminal.
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Launched => write!(f, "launched"),
            Self::Updated => write!(f, "updated"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What one `update` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Gateways that received a configuration, in delivery order.
    pub configured: Vec<String>,
    /// Configuration keys that matched no gateway.
    pub unknown: Vec<String>,
    /// Gateways that are active after this update.
    pub activated: Vec<String>,
    /// Configuration and activation failures (best-effort policy only).
    pub failures: Vec<GatewayFailure>,
    /// Authority or Controller calls that could not be delivered (best-effort policy only).
    pub collaborator_failures: Vec<String>,
    /// Whether `start_app` was delivered to the Controller.
    pub app_started: bool,
}

impl UpdateReport {
    /// Returns `true` when every gateway was configured and activated and the
    /// application was started.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.collaborator_failures.is_empty() && self.app_started
    }
}

/// Outcome of a completed shutdown.
///
/// Returned instead of raising a signal; the caller decides how to exit.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Name of the container that was shut down.
    pub container: String,
    /// How the supervised child ended, if one was running.
    pub exit: Option<ExitOutcome>,
    /// Gateways whose teardown failed.
    #[serde(serialize_with = "serialize_failures")]
    pub failed_teardowns: Vec<GatewayFailure>,
    /// Controller and authority calls that could not be delivered.
    pub collaborator_failures: Vec<String>,
    /// Why the supervised child could not be reaped, if it could not.
    pub reap_error: Option<String>,
    /// The child outlived the reap timeout and its process group was killed.
    /// Destroy was then run again by the orchestrator.
    pub killed: bool,
    /// Why that second destroy run failed, if it did.
    pub destroy_error: Option<String>,
    /// When the supervised child was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When shutdown completed.
    pub finished_at: DateTime<Utc>,
}

impl ShutdownReport {
    /// Returns `true` when every teardown and collaborator call succeeded and
    /// the child exited with code zero.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_teardowns.is_empty()
            && self.collaborator_failures.is_empty()
            && self.reap_error.is_none()
            && self.destroy_error.is_none()
            && self.exit.is_none_or(|outcome| outcome.success())
    }

    /// Process exit code to report for this shutdown.
    ///
    /// The child's own code when it ran, `1` if it succeeded but cleanup did not.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.exit {
            Some(outcome) if !outcome.success() => outcome.exit_code(),
            _ if self.is_clean() => 0,
            _ => 1,
        }
    }
}

fn serialize_failures<S>(failures: &[GatewayFailure], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(failures.iter().map(ToString::to_string))
}
