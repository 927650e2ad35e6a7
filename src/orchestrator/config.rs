//! Configuration for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::container::RuntimePrograms;

/// Default upper bound on a generated runtime command, in bytes.
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 4096;

/// What `update` does when a gateway rejects its configuration or fails to activate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationPolicy {
    /// Log the failure, keep going, start the application regardless.
    #[default]
    BestEffort,
    /// Attempt every gateway, then fail the update if any of them failed.
    Strict,
}

/// Configuration for an [`Orchestrator`](super::Orchestrator).
///
/// # Example
///
/// ```
/// use pelagicontain::orchestrator::{ActivationPolicy, OrchestratorConfig};
/// use std::time::Duration;
///
/// let config = OrchestratorConfig::default()
///     .with_shared_mounts_dir("/tmp/pelagicontain")
///     .with_activation_policy(ActivationPolicy::Strict)
///     .with_create_timeout(Duration::from_secs(30))
///     .with_reap_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root directory shared by all containers for handed-in mounts.
    pub shared_mounts_dir: PathBuf,

    /// Gateway failure handling during `update`.
    pub activation_policy: ActivationPolicy,

    /// Upper bound on each generated runtime command, in bytes.
    pub max_command_length: usize,

    /// Maximum time the create phase may take. `None` waits indefinitely.
    pub create_timeout: Option<Duration>,

    /// Maximum time to wait for the supervised child during shutdown.
    /// `None` waits indefinitely.
    pub reap_timeout: Option<Duration>,

    /// Runtime executables.
    pub runtime: RuntimePrograms,

    /// Shell used to run phase commands.
    pub shell: PathBuf,

    /// Host PulseAudio socket bridged by the audio gateway.
    pub pulse_socket: PathBuf,

    /// D-Bus proxy program spawned by the bus gateways, if any.
    pub dbus_proxy_program: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
        Self {
            shared_mounts_dir: runtime_dir
                .as_ref()
                .map_or_else(|| PathBuf::from("/tmp"), Clone::clone)
                .join("pelagicontain"),
            activation_policy: ActivationPolicy::default(),
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            create_timeout: None,
            reap_timeout: None,
            runtime: RuntimePrograms::default(),
            shell: PathBuf::from("/bin/sh"),
            pulse_socket: runtime_dir.map_or_else(
                || PathBuf::from("/run/pulse/native"),
                |dir| dir.join("pulse").join("native"),
            ),
            dbus_proxy_program: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shared mounts directory.
    #[must_use]
    pub fn with_shared_mounts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_mounts_dir = path.into();
        self
    }

    /// Sets the gateway activation policy.
    #[must_use]
    pub fn with_activation_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation_policy = policy;
        self
    }

    /// Sets the command length limit.
    #[must_use]
    pub fn with_max_command_length(mut self, limit: usize) -> Self {
        self.max_command_length = limit;
        self
    }

    /// Bounds the create phase.
    #[must_use]
    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = Some(timeout);
        self
    }

    /// Bounds the wait for the supervised child during shutdown.
    #[must_use]
    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = Some(timeout);
        self
    }

    /// Sets the runtime executables.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimePrograms) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the shell used to run phase commands.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the host PulseAudio socket.
    #[must_use]
    pub fn with_pulse_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.pulse_socket = path.into();
        self
    }

    /// Sets the D-Bus proxy program.
    #[must_use]
    pub fn with_dbus_proxy_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.dbus_proxy_program = Some(program.into());
        self
    }
}
