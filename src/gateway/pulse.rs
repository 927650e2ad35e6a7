//! PulseAudio gateway.
//!
//! When audio is enabled (`{"audio": true}`), activation bridges the host's
//! PulseAudio socket into the gateway directory so the contained application
//! reaches it through `PULSE_SERVER`.

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{
    CONTAINER_GATEWAY_DIR, Gateway, GatewayKind, GatewayState, ensure_gateway_dir, gateway_dir,
    gateway_mount_override, remove_if_present,
};
use crate::error::GatewayError;

const ID: &str = "pulseaudio";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PulseConfig {
    audio: bool,
}

/// Gateway bridging the host PulseAudio server into the container.
#[derive(Debug)]
pub struct PulseGateway {
    container_root: PathBuf,
    socket_name: String,
    host_socket: PathBuf,
    enabled: bool,
    bridged: bool,
    state: GatewayState,
}

impl PulseGateway {
    /// Creates an audio gateway for the given container.
    #[must_use]
    pub fn new(container_root: &Path, container_name: &str, host_socket: &Path) -> Self {
        Self {
            container_root: container_root.to_path_buf(),
            socket_name: format!("pulse-{container_name}.sock"),
            host_socket: host_socket.to_path_buf(),
            enabled: false,
            bridged: false,
            state: GatewayState::Created,
        }
    }

    /// Host-side path of the bridged socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        gateway_dir(&self.container_root).join(&self.socket_name)
    }

    /// Returns whether audio was enabled by configuration.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Gateway for PulseGateway {
    fn id(&self) -> &str {
        ID
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::AudioProxy
    }

    fn state(&self) -> GatewayState {
        self.state
    }

    #[instrument(skip(self), fields(gateway = ID))]
    fn set_config(&mut self, config: &str) -> Result<(), GatewayError> {
        let parsed: PulseConfig =
            serde_json::from_str(config).map_err(|e| GatewayError::InvalidConfig {
                id: ID.to_string(),
                reason: e.to_string(),
            })?;
        self.enabled = parsed.audio;
        if self.state != GatewayState::TornDown {
            self.state = GatewayState::Configured;
        }
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

        if !self.enabled {
            debug!("Audio not enabled, nothing to bridge");
            self.state = GatewayState::Active;
            return Ok(());
        }

        if !self.host_socket.exists() {
            return Err(GatewayError::ActivationFailed {
                id: ID.to_string(),
                reason: format!("host socket not found: {}", self.host_socket.display()),
            });
        }

        let dir = gateway_dir(&self.container_root);
        ensure_gateway_dir(ID, &dir)?;

        let socket = self.socket_path();
        let io_err = |context: String, source| GatewayError::Io {
            id: ID.to_string(),
            context,
            source,
        };
        remove_if_present(&socket)
            .map_err(|e| io_err(format!("failed to replace {}", socket.display()), e))?;
        symlink(&self.host_socket, &socket)
            .map_err(|e| io_err(format!("failed to bridge {}", socket.display()), e))?;

        debug!(socket = %socket.display(), host = %self.host_socket.display(), "Audio bridged");
        self.bridged = true;
        self.state = GatewayState::Active;
        Ok(())
    }

    #[instrument(skip(self), fields(gateway = ID))]
    fn teardown(&mut self) -> Result<(), GatewayError> {
        self.state = GatewayState::TornDown;
        if !self.bridged {
            return Ok(());
        }
        self.bridged = false;

        let socket = self.socket_path();
        remove_if_present(&socket).map_err(|e| {
            warn!(socket = %socket.display(), error = %e, "Could not remove audio bridge");
            GatewayError::TeardownFailed {
                id: ID.to_string(),
                reason: format!("failed to remove {}: {e}", socket.display()),
            }
        })?;
        Ok(())
    }

    fn runtime_overrides(&self) -> Vec<String> {
        vec![gateway_mount_override(&self.container_root)]
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![(
            "PULSE_SERVER".to_string(),
            format!("unix:{CONTAINER_GATEWAY_DIR}/{}", self.socket_name),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PulseGateway) {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let host_socket = temp_dir.path().join("native");
        File::create(&host_socket).expect("failed to create host socket stand-in");
        let gateway = PulseGateway::new(&temp_dir.path().join("root"), "ct", &host_socket);
        (temp_dir, gateway)
    }

    #[test]
    fn test_environment_points_into_gateway_dir() {
        let (_tmp, gateway) = fixture();
        assert_eq!(
            gateway.environment(),
            vec![("PULSE_SERVER".to_string(), "unix:/gateways/pulse-ct.sock".to_string())]
        );
    }

    #[test]
    fn test_disabled_activation_is_noop() {
        let (_tmp, mut gateway) = fixture();
        gateway.set_config(r#"{"audio": false}"#).unwrap();
        gateway.activate().unwrap();
        assert!(!gateway.socket_path().exists());
        assert_eq!(gateway.state(), GatewayState::Active);
    }

    #[test]
    fn test_enabled_activation_bridges_socket() {
        let (_tmp, mut gateway) = fixture();
        gateway.set_config(r#"{"audio": true}"#).unwrap();
        gateway.activate().unwrap();

        let link = gateway.socket_path();
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());

        // Re-activation replaces the bridge rather than failing.
        gateway.activate().unwrap();

        gateway.teardown().unwrap();
        assert!(link.symlink_metadata().is_err());
        assert_eq!(gateway.state(), GatewayState::TornDown);
    }

    #[test]
    fn test_missing_host_socket_fails_activation() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut gateway =
            PulseGateway::new(temp_dir.path(), "ct", &temp_dir.path().join("missing"));
        gateway.set_config(r#"{"audio": true}"#).unwrap();
        let err = gateway.activate().unwrap_err();
        assert!(matches!(err, GatewayError::ActivationFailed { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_tmp, mut gateway) = fixture();
        assert!(gateway.set_config("yes please").is_err());
        assert!(gateway.set_config(r#"{"volume": 3}"#).is_err());
    }

    #[test]
    fn test_teardown_without_activation() {
        let (_tmp, mut gateway) = fixture();
        gateway.teardown().unwrap();
        gateway.teardown().unwrap();
    }
}
