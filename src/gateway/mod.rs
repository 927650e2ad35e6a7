//! Gateways mediating container access to host resources.
//!
//! A gateway owns one host capability the contained application may use:
//! networking, audio, or one of the two D-Bus buses. Every gateway follows the
//! same contract:
//!
//! 1. `set_config()` delivers an opaque, variant-specific payload
//! 2. `activate()` performs the out-of-process wiring
//! 3. `teardown()` reverses it; never panics, reports failure instead
//!
//! # Gateway Directory
//!
//! Gateways place their endpoints and hand-off files in
//! `<container_root>/gateways/`, which is bind-mounted into the container at
//! `/gateways`.
//!
//! ```text
//! <container_root>/gateways/
//! ├── net_<name>.json     # Network address hand-off
//! ├── pulse-<name>.sock   # PulseAudio bridge (symlink to host socket)
//! ├── sess_<name>.json    # D-Bus session proxy configuration hand-off
//! ├── sess_<name>.sock    # D-Bus session proxy socket
//! ├── sys_<name>.json     # D-Bus system proxy configuration hand-off
//! └── sys_<name>.sock     # D-Bus system proxy socket
//! ```

mod dbus;
mod network;
mod pulse;

pub use dbus::{BusScope, DBusGateway};
pub use network::{Ipv4Cidr, NETWORK_CONFIG_VAR, NetworkGateway};
pub use pulse::PulseGateway;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::GatewayError;

/// Name of the gateway directory under the container root.
pub const GATEWAY_DIR: &str = "gateways";

/// Where the gateway directory appears inside the container.
pub const CONTAINER_GATEWAY_DIR: &str = "/gateways";

/// Activation state of a gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    /// Constructed, no configuration received.
    #[default]
    Created,
    /// Configuration stored, not yet activated.
    Configured,
    /// Activated.
    Active,
    /// Torn down; terminal.
    TornDown,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Configured => write!(f, "configured"),
            Self::Active => write!(f, "active"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// The closed set of gateway kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GatewayKind {
    /// Container network interface.
    Network,
    /// PulseAudio socket bridge.
    AudioProxy,
    /// D-Bus proxy for the given bus.
    BusProxy(BusScope),
}

impl GatewayKind {
    /// The kinds installed for every container, in activation order.
    pub const CANONICAL: [GatewayKind; 4] = [
        GatewayKind::Network,
        GatewayKind::AudioProxy,
        GatewayKind::BusProxy(BusScope::Session),
        GatewayKind::BusProxy(BusScope::System),
    ];
}

/// Capability interface shared by all gateways.
pub trait Gateway: Send {
    /// Stable identifier, used as the key in configuration mappings.
    fn id(&self) -> &str;

    /// Which variant this gateway is.
    fn kind(&self) -> GatewayKind;

    /// Current activation state.
    fn state(&self) -> GatewayState;

    /// Stores a configuration payload.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidConfig` if the payload is rejected.
    fn set_config(&mut self, config: &str) -> Result<(), GatewayError>;

    /// Wires the capability up. Without configuration this is a variant-defined
    /// default, typically a no-op that leaves the capability disabled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ActivationFailed` or `GatewayError::Io`.
    fn activate(&mut self) -> Result<(), GatewayError>;

    /// Reverses activation. Safe to call when never activated and when
    /// already torn down.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::TeardownFailed` if cleanup was incomplete. The
    /// gateway is `TornDown` afterwards regardless.
    fn teardown(&mut self) -> Result<(), GatewayError>;

    /// Runtime configuration overrides (`key=value`) for the execute command.
    fn runtime_overrides(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment variables for the contained process.
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Builds the gateway set installed for every container, in activation order.
#[must_use]
pub fn canonical_set(
    container_root: &Path,
    container_name: &str,
    pulse_socket: &Path,
    dbus_proxy_program: Option<&Path>,
) -> Vec<Box<dyn Gateway>> {
    GatewayKind::CANONICAL
        .iter()
        .map(|kind| -> Box<dyn Gateway> {
            match kind {
                GatewayKind::Network => {
                    Box::new(NetworkGateway::new(container_root, container_name))
                }
                GatewayKind::AudioProxy => Box::new(PulseGateway::new(
                    container_root,
                    container_name,
                    pulse_socket,
                )),
                GatewayKind::BusProxy(scope) => Box::new(DBusGateway::new(
                    *scope,
                    container_root,
                    container_name,
                    dbus_proxy_program.map(Path::to_path_buf),
                )),
            }
        })
        .collect()
}

/// Returns `<container_root>/gateways`.
#[must_use]
pub fn gateway_dir(container_root: &Path) -> PathBuf {
    container_root.join(GATEWAY_DIR)
}

/// Runtime override that bind-mounts the gateway directory into the container.
pub(crate) fn gateway_mount_override(container_root: &Path) -> String {
    format!(
        "lxc.mount.entry={} {} none bind,create=dir 0 0",
        gateway_dir(container_root).display(),
        GATEWAY_DIR
    )
}

pub(crate) fn ensure_gateway_dir(id: &str, dir: &Path) -> Result<(), GatewayError> {
    fs::create_dir_all(dir).map_err(|e| GatewayError::Io {
        id: id.to_string(),
        context: format!("failed to create gateway directory: {}", dir.display()),
        source: e,
    })
}

/// Removes a file or symlink if present. Returns whether anything was removed.
pub(crate) fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
