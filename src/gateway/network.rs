//! Network gateway.
//!
//! Configuration is the IPv4 address of the container's interface in CIDR
//! notation (`10.0.0.5/24`), either bare or as a JSON string. Activation hands
//! the address to the in-container side through `net_<name>.json` in the
//! gateway directory, which the contained process finds through
//! `PELAGICONTAIN_NETWORK_CONFIG`:
//!
//! ```json
//! {"address": "10.0.0.5", "prefix": 24, "cidr": "10.0.0.5/24"}
//! ```
//!
//! The file is written after the container is running, so it is the only
//! channel that sees configuration delivered by `update`. Without
//! configuration no file exists and the container gets no network.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, instrument, trace};

use super::{
    CONTAINER_GATEWAY_DIR, Gateway, GatewayKind, GatewayState, ensure_gateway_dir, gateway_dir,
    gateway_mount_override, remove_if_present,
};
use crate::error::GatewayError;

const ID: &str = "network";

/// Variable naming the in-container path of the hand-off file.
pub const NETWORK_CONFIG_VAR: &str = "PELAGICONTAIN_NETWORK_CONFIG";

/// An IPv4 address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    /// Interface address.
    pub addr: Ipv4Addr,
    /// Prefix length, 0..=32.
    pub prefix: u8,
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("expected address/prefix, got {s:?}"))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("invalid IPv4 address {addr:?}: {e}"))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| format!("invalid prefix length {prefix:?}"))?;
        if prefix > 32 {
            return Err(format!("prefix length {prefix} exceeds 32"));
        }
        Ok(Self { addr, prefix })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Serialize)]
struct Handoff {
    address: Ipv4Addr,
    prefix: u8,
    cidr: String,
}

/// Gateway granting the container an IPv4 address.
#[derive(Debug)]
pub struct NetworkGateway {
    container_root: PathBuf,
    file_name: String,
    configured: Option<Ipv4Cidr>,
    active: Option<Ipv4Cidr>,
    state: GatewayState,
}

impl NetworkGateway {
    /// Creates an unconfigured network gateway for the named container.
    #[must_use]
    pub fn new(container_root: &Path, container_name: &str) -> Self {
        Self {
            container_root: container_root.to_path_buf(),
            file_name: format!("net_{container_name}.json"),
            configured: None,
            active: None,
            state: GatewayState::Created,
        }
    }

    /// Returns the address currently in effect, if activated with one.
    #[must_use]
    pub fn address(&self) -> Option<Ipv4Cidr> {
        self.active
    }

    /// Host-side path of the address hand-off file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        gateway_dir(&self.container_root).join(&self.file_name)
    }

    fn write_handoff(&self, cidr: Ipv4Cidr) -> Result<(), GatewayError> {
        let path = self.config_path();
        let io_err = |context: String, source| GatewayError::Io {
            id: ID.to_string(),
            context,
            source,
        };

        let handoff = Handoff {
            address: cidr.addr,
            prefix: cidr.prefix,
            cidr: cidr.to_string(),
        };
        let json = serde_json::to_string_pretty(&handoff).map_err(|e| {
            io_err(
                "failed to serialize network configuration".to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)
            .map_err(|e| io_err(format!("failed to write {}", temp_path.display()), e))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| io_err(format!("failed to rename to {}", path.display()), e))?;

        trace!(path = %path.display(), "Network configuration handed off");
        Ok(())
    }

    fn remove_handoff(&self) -> std::io::Result<()> {
        remove_if_present(&self.config_path()).map(|_| ())
    }
}

impl Gateway for NetworkGateway {
    fn id(&self) -> &str {
        ID
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Network
    }

    fn state(&self) -> GatewayState {
        self.state
    }

    #[instrument(skip(self), fields(gateway = ID))]
    fn set_config(&mut self, config: &str) -> Result<(), GatewayError> {
        let invalid = |reason: String| GatewayError::InvalidConfig {
            id: ID.to_string(),
            reason,
        };

        let trimmed = config.trim();
        let raw = if trimmed.starts_with('"') {
            serde_json::from_str::<String>(trimmed).map_err(|e| invalid(e.to_string()))?
        } else {
            trimmed.to_string()
        };

        self.configured = if raw.is_empty() {
            None
        } else {
            Some(raw.parse::<Ipv4Cidr>().map_err(invalid)?)
        };

        if self.state != GatewayState::TornDown {
            self.state = GatewayState::Configured;
        }
        debug!(address = ?self.configured, "Network configuration stored");
        Ok(())
    }

    #[instrument(skip(self), fields(gateway = ID))]
    fn activate(&mut self) -> Result<(), GatewayError> {
        if self.state == GatewayState::TornDown {
            return Err(GatewayError::ActivationFailed {
                id: ID.to_string(),
                reason: "gateway has been torn down".to_string(),
            });
        }

        match self.configured {
            Some(cidr) => {
                ensure_gateway_dir(ID, &gateway_dir(&self.container_root))?;
                self.write_handoff(cidr)?;
                debug!(address = %cidr, "Network enabled");
            }
            None => {
                // A later update may withdraw an address granted earlier.
                if self.active.is_some() {
                    self.remove_handoff().map_err(|e| GatewayError::Io {
                        id: ID.to_string(),
                        context: format!("failed to remove {}", self.config_path().display()),
                        source: e,
                    })?;
                }
                debug!("No network configuration, networking disabled");
            }
        }
        self.active = self.configured;
        self.state = GatewayState::Active;
        Ok(())
    }

    #[instrument(skip(self), fields(gateway = ID))]
    fn teardown(&mut self) -> Result<(), GatewayError> {
        self.state = GatewayState::TornDown;
        if self.active.take().is_none() {
            return Ok(());
        }
        self.remove_handoff()
            .map_err(|e| GatewayError::TeardownFailed {
                id: ID.to_string(),
                reason: format!("failed to remove {}: {e}", self.config_path().display()),
            })
    }

    fn runtime_overrides(&self) -> Vec<String> {
        vec![gateway_mount_override(&self.container_root)]
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![(
            NETWORK_CONFIG_VAR.to_string(),
            format!("{CONTAINER_GATEWAY_DIR}/{}", self.file_name),
        )]
    }
}
