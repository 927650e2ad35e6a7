//! The lifecycle state machine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::{
    ActivationPolicy, Controller, LifecycleState, OrchestratorConfig, RegistrationAuthority,
    ShutdownReport, UpdateReport,
};
use crate::container::{Container, ExitOutcome, Phase, SupervisedProcess, Workspace};
use crate::container::{run_phase, spawn_supervised};
use crate::error::{CollaboratorError, GatewayError, GatewayFailure, LifecycleError, Result};
use crate::gateway::{self, Gateway};

/// Directory under the container root used as the application rootfs.
const APP_ROOT: &str = "rootfs/";

/// Drives one container from creation to teardown.
///
/// # Example
///
/// ```no_run
/// use std::collections::HashMap;
/// use pelagicontain::orchestrator::{
///     FifoController, LoggingAuthority, Orchestrator, OrchestratorConfig,
/// };
///
/// let root = std::path::Path::new("/tmp/c1");
/// let mut orchestrator = Orchestrator::new(
///     OrchestratorConfig::default(),
///     Box::new(FifoController::new(root)),
///     Box::new(LoggingAuthority),
/// );
///
/// orchestrator.initialize(root, "/etc/pelagicontain").unwrap();
/// let pid = orchestrator.run("/controller/controller", "cookie").unwrap();
/// orchestrator.launch("com.example.app").unwrap();
///
/// let configs = HashMap::from([("network".to_string(), "10.0.3.7/24".to_string())]);
/// orchestrator.update(&configs).unwrap();
///
/// let report = orchestrator.shutdown().unwrap();
/// println!("child {pid} {:?}", report.exit);
/// ```
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: LifecycleState,
    workspace: Workspace,
    container_root: Option<PathBuf>,
    cookie: Option<String>,
    app_id: Option<String>,
    container: Option<Container>,
    gateways: Vec<Box<dyn Gateway>>,
    controller: Box<dyn Controller>,
    authority: Box<dyn RegistrationAuthority>,
    child: Option<SupervisedProcess>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .field("container", &self.container)
            .field("container_root", &self.container_root)
            .field("app_id", &self.app_id)
            .field(
                "gateways",
                &self.gateways.iter().map(|g| g.id()).collect::<Vec<_>>(),
            )
            .field("child", &self.child.as_ref().map(SupervisedProcess::pid))
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator in the `New` state.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        controller: Box<dyn Controller>,
        authority: Box<dyn RegistrationAuthority>,
    ) -> Self {
        let workspace = Workspace::new(&config.shared_mounts_dir);
        Self {
            config,
            state: LifecycleState::New,
            workspace,
            container_root: None,
            cookie: None,
            app_id: None,
            container: None,
            gateways: Vec::new(),
            controller,
            authority,
            child: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The orchestrator's configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The container, once initialized.
    #[must_use]
    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    /// The installed gateways, in activation order.
    #[must_use]
    pub fn gateways(&self) -> &[Box<dyn Gateway>] {
        &self.gateways
    }

    /// The shared workspace.
    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// PID of the supervised child, while one is held.
    #[must_use]
    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(SupervisedProcess::pid)
    }

    /// Checks whether the supervised child has exited, without blocking.
    ///
    /// Returns `None` while the child is running or when there is none.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Wait` if the child's status cannot be queried.
    pub fn poll_child(&mut self) -> Result<Option<ExitOutcome>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_outcome()?),
            None => Ok(None),
        }
    }

    /// Prepares the workspace, the container and the canonical gateway set.
    ///
    /// New → Initialized.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `LifecycleError::OrderViolation` unless the state is `New`
    /// - `WorkspaceError::InitFailed` if the shared workspace cannot be created
    #[instrument(skip(self, container_root, container_config))]
    pub fn initialize(
        &mut self,
        container_root: impl Into<PathBuf>,
        container_config: impl Into<PathBuf>,
    ) -> Result<()> {
        self.require("initialize", &[LifecycleState::New])?;
        self.workspace.check_workspace()?;

        let container_root = container_root.into();
        let container = Container::with_generated_name(container_config);
        let gateways = gateway::canonical_set(
            &container_root,
            container.name(),
            &self.config.pulse_socket,
            self.config.dbus_proxy_program.as_deref(),
        );
        self.install(container_root, container, gateways);
        Ok(())
    }

    /// Like [`initialize`](Self::initialize), with a caller-supplied gateway set.
    ///
    /// The gateways are activated and torn down in the order given.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize).
    #[instrument(skip_all, fields(gateways = gateways.len()))]
    pub fn initialize_with(
        &mut self,
        container_root: impl Into<PathBuf>,
        container_config: impl Into<PathBuf>,
        gateways: Vec<Box<dyn Gateway>>,
    ) -> Result<()> {
        self.require("initialize", &[LifecycleState::New])?;
        self.workspace.check_workspace()?;

        let container = Container::with_generated_name(container_config);
        self.install(container_root.into(), container, gateways);
        Ok(())
    }

    fn install(
        &mut self,
        container_root: PathBuf,
        container: Container,
        gateways: Vec<Box<dyn Gateway>>,
    ) {
        info!(
            container = container.name(),
            root = %container_root.display(),
            gateways = gateways.len(),
            "Container initialized"
        );
        self.container_root = Some(container_root);
        self.container = Some(container);
        self.gateways = gateways;
        self.state = LifecycleState::Initialized;
    }

    /// Creates the container and starts the supervised child running the
    /// execute and destroy phases. Returns the child's PID without waiting.
    ///
    /// Initialized → Running.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `LifecycleError::OrderViolation` unless the state is `Initialized`
    /// - `ContainerError` if the commands cannot be built; nothing has run yet
    /// - `RuntimeError` if the create phase fails or the child cannot be spawned
    #[instrument(skip(self, cookie))]
    pub fn run(&mut self, contained_command: &str, cookie: &str) -> Result<u32> {
        self.require("run", &[LifecycleState::Initialized])?;
        let (container_root, container) = self.prepared("run")?;
        let name = container.name().to_string();

        let commands = container.commands(
            contained_command,
            &self.gateways,
            &container_root.join(APP_ROOT),
            &self.config.runtime,
            self.config.max_command_length,
        )?;
        self.cookie = Some(cookie.to_string());

        run_phase(
            &self.config.shell,
            &name,
            Phase::Create,
            &commands.create,
            self.config.create_timeout,
        )?;

        let child = spawn_supervised(
            &self.config.shell,
            &name,
            &commands.execute,
            &commands.destroy,
        )?;
        let pid = child.pid();
        self.child = Some(child);
        self.state = LifecycleState::Running;

        info!(container = %name, pid, "Container running");
        Ok(pid)
    }

    /// Registers the application with the authority.
    ///
    /// Running → Launched. On failure the state stays `Running` and the
    /// container is still up; [`shutdown`](Self::shutdown) cleans it up.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `LifecycleError::OrderViolation` unless the state is `Running`
    /// - `CollaboratorError::Authority` if registration cannot be delivered
    #[instrument(skip(self))]
    pub fn launch(&mut self, app_id: &str) -> Result<()> {
        self.require("launch", &[LifecycleState::Running])?;
        let cookie = self.cookie.as_deref().unwrap_or_default();

        self.authority.register_client(cookie, app_id)?;
        self.app_id = Some(app_id.to_string());
        self.state = LifecycleState::Launched;

        info!(app_id, "Application launched");
        Ok(())
    }

    /// Delivers gateway configurations, activates every gateway and starts the
    /// application.
    ///
    /// Each entry in `configs` goes to the gateway with the matching id. Keys
    /// without a gateway are reported and otherwise ignored. Under
    /// `ActivationPolicy::BestEffort` failures are logged and collected in
    /// the report. Under `ActivationPolicy::Strict` every gateway is still
    /// attempted, but any failure fails the update before the application is
    /// started, leaving the state unchanged.
    ///
    /// Launched | Updated → Updated.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `LifecycleError::OrderViolation` unless the state is `Launched` or `Updated`
    /// - `GatewayError::Activation` under the strict policy when any gateway failed
    /// - `CollaboratorError` under the strict policy when a call could not be delivered
    #[instrument(skip(self, configs), fields(configs = configs.len()))]
    pub fn update(&mut self, configs: &HashMap<String, String>) -> Result<UpdateReport> {
        self.require("update", &[LifecycleState::Launched, LifecycleState::Updated])?;
        let strict = self.config.activation_policy == ActivationPolicy::Strict;
        let mut report = UpdateReport::default();

        for gateway in &mut self.gateways {
            let Some(config) = configs.get(gateway.id()) else {
                continue;
            };
            match gateway.set_config(config) {
                Ok(()) => report.configured.push(gateway.id().to_string()),
                Err(e) => {
                    warn!(gateway = gateway.id(), error = %e, "Gateway rejected configuration");
                    report.failures.push(failure(&**gateway, &e));
                }
            }
        }

        report.unknown = configs
            .keys()
            .filter(|key| !self.gateways.iter().any(|g| g.id() == key.as_str()))
            .cloned()
            .collect();
        report.unknown.sort();
        if !report.unknown.is_empty() {
            warn!(unknown = ?report.unknown, "Configuration for unknown gateways ignored");
        }

        let app_id = self.app_id.clone().unwrap_or_default();
        let mut deferred: Option<CollaboratorError> = None;
        if let Err(e) = self.authority.update_finished(&app_id) {
            warn!(error = %e, "Authority did not receive update_finished");
            report.collaborator_failures.push(e.to_string());
            deferred = Some(e);
        }

        for gateway in &mut self.gateways {
            match gateway.activate() {
                Ok(()) => report.activated.push(gateway.id().to_string()),
                Err(e) => {
                    warn!(gateway = gateway.id(), error = %e, "Gateway activation failed");
                    report.failures.push(failure(&**gateway, &e));
                }
            }
        }

        if strict {
            if !report.failures.is_empty() {
                return Err(GatewayError::Activation {
                    container: self.container_name().to_string(),
                    failures: report.failures,
                }
                .into());
            }
            if let Some(e) = deferred {
                return Err(e.into());
            }
        }

        match self.controller.start_app() {
            Ok(()) => report.app_started = true,
            Err(e) if strict => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Controller did not receive start_app");
                report.collaborator_failures.push(e.to_string());
            }
        }

        self.state = LifecycleState::Updated;
        debug!(
            configured = report.configured.len(),
            activated = report.activated.len(),
            failures = report.failures.len(),
            "Update complete"
        );
        Ok(report)
    }

    /// Stops the application, tears down every gateway, unregisters the
    /// application and reaps the supervised child.
    ///
    /// Every step is attempted whatever the previous ones did. Failures end up
    /// in the returned report. From `Running` (a failed `launch`) there is no
    /// application to unregister, so that step is skipped.
    ///
    /// Running | Launched | Updated → ShuttingDown → Terminated.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::OrderViolation` unless the state is `Running`,
    /// `Launched` or `Updated`.
    #[instrument(skip(self), fields(container = self.container_name()))]
    pub fn shutdown(&mut self) -> Result<ShutdownReport> {
        self.require(
            "shutdown",
            &[
                LifecycleState::Running,
                LifecycleState::Launched,
                LifecycleState::Updated,
            ],
        )?;
        self.state = LifecycleState::ShuttingDown;

        let mut collaborator_failures = Vec::new();
        if let Err(e) = self.controller.shutdown() {
            warn!(error = %e, "Controller did not receive shutdown");
            collaborator_failures.push(e.to_string());
        }

        let mut failed_teardowns = Vec::new();
        for gateway in &mut self.gateways {
            if let Err(e) = gateway.teardown() {
                warn!(gateway = gateway.id(), error = %e, "Gateway teardown failed");
                failed_teardowns.push(failure(&**gateway, &e));
            }
        }

        if let Some(app_id) = self.app_id.as_deref() {
            if let Err(e) = self.authority.unregister_client(app_id) {
                warn!(error = %e, "Authority did not receive unregister_client");
                collaborator_failures.push(e.to_string());
            }
        }

        let mut exit = None;
        let mut reap_error = None;
        let mut killed = false;
        let mut destroy_error = None;
        let mut started_at = None;
        if let Some(mut child) = self.child.take() {
            started_at = Some(child.started_at());
            match child.wait(self.config.reap_timeout) {
                Ok(reaped) => {
                    debug!(pid = child.pid(), outcome = %reaped.outcome, "Supervised child reaped");
                    exit = Some(reaped.outcome);
                    if let Some(destroyed) = reaped.forced_destroy {
                        killed = true;
                        destroy_error = destroyed.err().map(|e| e.to_string());
                    }
                }
                Err(e) => {
                    warn!(pid = child.pid(), error = %e, "Supervised child could not be reaped");
                    reap_error = Some(e.to_string());
                }
            }
        }

        self.state = LifecycleState::Terminated;
        let report = ShutdownReport {
            container: self.container_name().to_string(),
            exit,
            failed_teardowns,
            collaborator_failures,
            reap_error,
            killed,
            destroy_error,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            exit = ?report.exit,
            killed = report.killed,
            failed_teardowns = report.failed_teardowns.len(),
            "Shutdown complete"
        );
        Ok(report)
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[LifecycleState],
    ) -> std::result::Result<(), LifecycleError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LifecycleError::OrderViolation {
                operation,
                state: self.state,
            })
        }
    }

    fn prepared(
        &self,
        operation: &'static str,
    ) -> std::result::Result<(&Path, &Container), LifecycleError> {
        match (self.container_root.as_deref(), self.container.as_ref()) {
            (Some(root), Some(container)) => Ok((root, container)),
            _ => Err(LifecycleError::OrderViolation {
                operation,
                state: self.state,
            }),
        }
    }

    fn container_name(&self) -> &str {
        self.container.as_ref().map_or("", Container::name)
    }
}

fn failure(gateway: &dyn Gateway, error: &GatewayError) -> GatewayFailure {
    GatewayFailure {
        gateway: gateway.id().to_string(),
        reason: error.to_string(),
    }
}
