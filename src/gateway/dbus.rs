//! D-Bus proxy gateways (session and system bus).
//!
//! Configuration is a JSON object holding the proxy's access rules. On
//! activation the object is handed off to the proxy through a file in the
//! gateway directory and, when a proxy program is configured, the proxy is
//! spawned with the configuration on stdin:
//!
//! ```text
//! <program> <gateway_dir>/<prefix>_<name>.sock <session|system>
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use super::{
    CONTAINER_GATEWAY_DIR, Gateway, GatewayKind, GatewayState, ensure_gateway_dir, gateway_dir,
    gateway_mount_override, remove_if_present,
};
use crate::error::GatewayError;

/// Which bus a proxy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusScope {
    /// The user session bus.
    Session,
    /// The system bus.
    System,
}

impl BusScope {
    /// Gateway identifier for this scope.
    #[must_use]
    pub fn gateway_id(self) -> &'static str {
        match self {
            Self::Session => "dbus-session",
            Self::System => "dbus-system",
        }
    }

    /// Argument passed to the proxy program.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::System => "system",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            Self::Session => "sess",
            Self::System => "sys",
        }
    }

    fn address_var(self) -> &'static str {
        match self {
            Self::Session => "DBUS_SESSION_BUS_ADDRESS",
            Self::System => "DBUS_SYSTEM_BUS_ADDRESS",
        }
    }
}

/// Gateway proxying one D-Bus bus into the container.
#[derive(Debug)]
pub struct DBusGateway {
    scope: BusScope,
    container_root: PathBuf,
    base_name: String,
    proxy_program: Option<PathBuf>,
    config: Option<Value>,
    proxy: Option<Child>,
    handed_off: bool,
    state: GatewayState,
}

impl DBusGateway {
    /// Creates a proxy gateway for the given bus.
    #[must_use]
    pub fn new(
        scope: BusScope,
        container_root: &Path,
        container_name: &str,
        proxy_program: Option<PathBuf>,
    ) -> Self {
        Self {
            scope,
            container_root: container_root.to_path_buf(),
            base_name: format!("{}_{container_name}", scope.file_prefix()),
            proxy_program,
            config: None,
            proxy: None,
            handed_off: false,
            state: GatewayState::Created,
        }
    }

    /// Bus served by this gateway.
    #[must_use]
    pub fn scope(&self) -> BusScope {
        self.scope
    }

    /// Host-side path of the proxy socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        gateway_dir(&self.container_root).join(format!("{}.sock", self.base_name))
    }

    /// Host-side path of the configuration hand-off file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        gateway_dir(&self.container_root).join(format!("{}.json", self.base_name))
    }

    /// PID of the running proxy, if one was spawned.
    #[must_use]
    pub fn proxy_pid(&self) -> Option<u32> {
        self.proxy.as_ref().map(Child::id)
    }

    fn write_handoff(&self, config: &Value) -> Result<(), GatewayError> {
        let id = self.scope.gateway_id();
        let path = self.config_path();
        let io_err = |context: String, source| GatewayError::Io {
            id: id.to_string(),
            context,
            source,
        };

        let json = serde_json::to_string_pretty(config).map_err(|e| {
            io_err(
                "failed to serialize proxy configuration".to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        // Write to temp file first for atomic update
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)
            .map_err(|e| io_err(format!("failed to write {}", temp_path.display()), e))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| io_err(format!("failed to rename to {}", path.display()), e))?;

        trace!(path = %path.display(), "Proxy configuration handed off");
        Ok(())
    }

    fn spawn_proxy(&self, program: &Path, config: &Value) -> Result<Child, GatewayError> {
        let id = self.scope.gateway_id();
        let failed = |reason: String| GatewayError::ActivationFailed {
            id: id.to_string(),
            reason,
        };

        let mut child = Command::new(program)
            .arg(self.socket_path())
            .arg(self.scope.as_arg())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to spawn {}: {e}", program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(config.to_string().as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(failed(format!("failed to send configuration to proxy: {e}")));
            }
            // Dropping stdin closes it, which the proxy takes as end of configuration.
        }

        debug!(pid = child.id(), program = %program.display(), "Proxy started");
        Ok(child)
    }

    fn stop_proxy(&mut self) -> Result<(), String> {
        let Some(mut child) = self.proxy.take() else {
            return Ok(());
        };
        // kill() fails with InvalidInput once the child has already been reaped.
        if let Err(e) = child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(format!("failed to stop proxy {}: {e}", child.id()));
            }
        }
        child
            .wait()
            .map(|_| ())
            .map_err(|e| format!("failed to reap proxy: {e}"))
    }
}

impl Gateway for DBusGateway {
    fn id(&self) -> &str {
        self.scope.gateway_id()
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::BusProxy(self.scope)
    }

    fn state(&self) -> GatewayState {
        self.state
    }

    #[instrument(skip(self, config), fields(gateway = self.scope.gateway_id()))]
    fn set_config(&mut self, config: &str) -> Result<(), GatewayError> {
        let invalid = |reason: String| GatewayError::InvalidConfig {
            id: self.scope.gateway_id().to_string(),
            reason,
        };
        let value: Value = serde_json::from_str(config).map_err(|e| invalid(e.to_string()))?;
        if !value.is_object() {
            return Err(invalid("expected a JSON object".to_string()));
        }

        self.config = Some(value);
        if self.state != GatewayState::TornDown {
            self.state = GatewayState::Configured;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(gateway = self.scope.gateway_id()))]
    fn activate(&mut self) -> Result<(), GatewayError> {
        let id = self.scope.gateway_id();
        if self.state == GatewayState::TornDown {
            return Err(GatewayError::ActivationFailed {
                id: id.to_string(),
                reason: "gateway has been torn down".to_string(),
            });
        }

        let Some(config) = self.config.clone() else {
            debug!("No proxy configuration, bus not exposed");
            self.state = GatewayState::Active;
            return Ok(());
        };

        ensure_gateway_dir(id, &gateway_dir(&self.container_root))?;
        self.write_handoff(&config)?;
        self.handed_off = true;

        if let Some(program) = self.proxy_program.clone() {
            if let Err(reason) = self.stop_proxy() {
                warn!(%reason, "Previous proxy did not stop cleanly");
            }
            self.proxy = Some(self.spawn_proxy(&program, &config)?);
        }

        self.state = GatewayState::Active;
        Ok(())
    }

    #[instrument(skip(self), fields(gateway = self.scope.gateway_id()))]
    fn teardown(&mut self) -> Result<(), GatewayError> {
        self.state = GatewayState::TornDown;
        let mut problems = Vec::new();

        if let Err(reason) = self.stop_proxy() {
            problems.push(reason);
        }

        if self.handed_off {
            self.handed_off = false;
            for path in [self.config_path(), self.socket_path()] {
                if let Err(e) = remove_if_present(&path) {
                    problems.push(format!("failed to remove {}: {e}", path.display()));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::TeardownFailed {
                id: self.scope.gateway_id().to_string(),
                reason: problems.join("; "),
            })
        }
    }

    fn runtime_overrides(&self) -> Vec<String> {
        vec![gateway_mount_override(&self.container_root)]
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![(
            self.scope.address_var().to_string(),
            format!("unix:path={CONTAINER_GATEWAY_DIR}/{}.sock", self.base_name),
        )]
    }
}

impl Drop for DBusGateway {
    fn drop(&mut self) {
        if let Err(reason) = self.stop_proxy() {
            warn!(gateway = self.scope.gateway_id(), %reason, "Proxy left running on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scope_identifiers() {
        assert_eq!(BusScope::Session.gateway_id(), "dbus-session");
        assert_eq!(BusScope::System.gateway_id(), "dbus-system");
        assert_eq!(BusScope::System.as_arg(), "system");
    }

    #[test]
    fn test_environment_per_scope() {
        let root = Path::new("/tmp/c1");
        let session = DBusGateway::new(BusScope::Session, root, "ct", None);
        let system = DBusGateway::new(BusScope::System, root, "ct", None);

        assert_eq!(
            session.environment(),
            vec![(
                "DBUS_SESSION_BUS_ADDRESS".to_string(),
                "unix:path=/gateways/sess_ct.sock".to_string()
            )]
        );
        assert_eq!(system.environment()[0].1, "unix:path=/gateways/sys_ct.sock");
        assert_eq!(session.socket_path(), PathBuf::from("/tmp/c1/gateways/sess_ct.sock"));
    }

    #[test]
    fn test_config_must_be_object() {
        let mut gateway = DBusGateway::new(BusScope::Session, Path::new("/tmp"), "ct", None);
        assert!(gateway.set_config("[1, 2]").is_err());
        assert!(gateway.set_config("not json").is_err());
        assert_eq!(gateway.state(), GatewayState::Created);

        gateway.set_config(r#"{"dbus-gateway-config": []}"#).unwrap();
        assert_eq!(gateway.state(), GatewayState::Configured);
    }

    #[test]
    fn test_activation_hands_off_config() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut gateway = DBusGateway::new(BusScope::System, temp_dir.path(), "ct", None);
        gateway
            .set_config(r#"{"dbus-gateway-config": [{"direction": "*"}]}"#)
            .unwrap();
        gateway.activate().unwrap();

        let written = fs::read_to_string(gateway.config_path()).expect("hand-off missing");
        let value: Value = serde_json::from_str(&written).unwrap();
        assert!(value.get("dbus-gateway-config").is_some());

        gateway.teardown().unwrap();
        assert!(!gateway.config_path().exists());
    }

    #[test]
    fn test_activation_without_config_is_noop() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut gateway = DBusGateway::new(BusScope::Session, temp_dir.path(), "ct", None);
        gateway.activate().unwrap();
        assert!(!gateway.config_path().exists());
        assert_eq!(gateway.state(), GatewayState::Active);
    }

    #[test]
    fn test_proxy_spawned_and_stopped() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut gateway = DBusGateway::new(
            BusScope::Session,
            temp_dir.path(),
            "ct",
            Some(PathBuf::from("/bin/sh")),
        );
        // `sh <socket> session` runs the socket path as a script.
        fs::create_dir_all(gateway_dir(temp_dir.path())).expect("failed to create gateway dir");
        fs::write(gateway.socket_path(), "cat >/dev/null\nexec sleep 30\n")
            .expect("failed to write proxy stand-in");

        gateway.set_config("{}").unwrap();
        gateway.activate().unwrap();
        assert!(gateway.proxy_pid().is_some());

        gateway.teardown().unwrap();
        assert!(gateway.proxy_pid().is_none());
        assert!(!gateway.socket_path().exists());
    }

    #[test]
    fn test_missing_proxy_program_fails_activation() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut gateway = DBusGateway::new(
            BusScope::Session,
            temp_dir.path(),
            "ct",
            Some(temp_dir.path().join("no-such-proxy")),
        );
        gateway.set_config("{}").unwrap();
        let err = gateway.activate().unwrap_err();
        assert!(matches!(err, GatewayError::ActivationFailed { .. }));
    }
}
