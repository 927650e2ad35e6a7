//! Pelagicontain - Entry Point
//!
//! Runs one container through its whole lifecycle: initialize, run, launch,
//! update, then shutdown on Ctrl-C, SIGTERM or when the container exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use pelagicontain::orchestrator::{
    ActivationPolicy, FifoController, LoggingAuthority, Orchestrator, OrchestratorConfig,
};
use pelagicontain::system;

/// How often the supervised child is polled while waiting for a signal.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Pelagicontain - gateway-mediated application containers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Container root directory (holds rootfs/, gateways/ and the Controller FIFO)
    container_root: PathBuf,

    /// Command run inside the container, usually the Controller
    command: String,

    /// Cookie identifying the client that requested the container
    cookie: String,

    /// Runtime configuration file for the container
    #[arg(long, env = "PELAGICONTAIN_CONTAINER_CONFIG", default_value = "/etc/pelagicontain")]
    container_config: PathBuf,

    /// Application identifier registered with the authority
    #[arg(long, env = "PELAGICONTAIN_APP_ID", default_value = "application")]
    app_id: String,

    /// Gateway configuration as ID=VALUE (repeatable)
    #[arg(long = "gateway-config", value_name = "ID=VALUE", value_parser = parse_gateway_config)]
    gateway_configs: Vec<(String, String)>,

    /// Directory shared by all containers for handed-in mounts
    #[arg(long, env = "PELAGICONTAIN_SHARED_MOUNTS_DIR")]
    shared_mounts_dir: Option<PathBuf>,

    /// Host PulseAudio socket bridged into the container
    #[arg(long, env = "PELAGICONTAIN_PULSE_SOCKET")]
    pulse_socket: Option<PathBuf>,

    /// D-Bus proxy program spawned by the bus gateways
    #[arg(long, env = "PELAGICONTAIN_DBUS_PROXY")]
    dbus_proxy: Option<PathBuf>,

    /// Seconds the create phase may take
    #[arg(long, value_name = "SECS")]
    create_timeout: Option<u64>,

    /// Seconds to wait for the container to exit during shutdown before killing it
    #[arg(long, value_name = "SECS")]
    reap_timeout: Option<u64>,

    /// Fail the update, and do not start the application, if any gateway fails
    #[arg(long, default_value = "false")]
    strict_gateways: bool,

    /// Skip the runtime program checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn parse_gateway_config(s: &str) -> std::result::Result<(String, String), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=VALUE, got {s:?}"))?;
    if id.is_empty() {
        return Err("gateway id is empty".to_string());
    }
    Ok((id.to_string(), value.to_string()))
}

impl Args {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new();
        if let Some(dir) = &self.shared_mounts_dir {
            config = config.with_shared_mounts_dir(dir);
        }
        if let Some(socket) = &self.pulse_socket {
            config = config.with_pulse_socket(socket);
        }
        if let Some(program) = &self.dbus_proxy {
            config = config.with_dbus_proxy_program(program);
        }
        if let Some(secs) = self.create_timeout {
            config = config.with_create_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.reap_timeout {
            config = config.with_reap_timeout(Duration::from_secs(secs));
        }
        if self.strict_gateways {
            config = config.with_activation_policy(ActivationPolicy::Strict);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Pelagicontain v{}", env!("CARGO_PKG_VERSION"));

    let config = args.orchestrator_config();

    if args.skip_checks {
        warn!("Skipping runtime program checks (--skip-checks)");
    } else {
        match system::check_all(&config) {
            Ok(reqs) => {
                info!(
                    "Runtime programs found: {}, {}, {}",
                    reqs.create.display(),
                    reqs.execute.display(),
                    reqs.destroy.display()
                );
            }
            Err(e) => {
                error!("Runtime program check failed");
                return Err(e).into_diagnostic();
            }
        }
    }

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(FifoController::new(&args.container_root)),
        Box::new(LoggingAuthority),
    );

    orchestrator.initialize(&args.container_root, &args.container_config)?;
    let pid = orchestrator.run(&args.command, &args.cookie)?;
    info!(pid, "Container started");

    // From here on the child is running: every exit path goes through shutdown.
    let supervised = supervise(&mut orchestrator, &args).await;
    if let Err(e) = &supervised {
        error!("Shutting down after failure: {e}");
    }

    let report = orchestrator.shutdown()?;
    for failure in &report.failed_teardowns {
        warn!("Teardown failed: {failure}");
    }
    if let Some(e) = &report.destroy_error {
        warn!("Destroy after kill failed: {e}");
    }
    match serde_json::to_string(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Could not serialize shutdown report: {e}"),
    }

    supervised?;
    std::process::exit(report.exit_code());
}

/// Launches the application, delivers gateway configuration and waits for
/// the container to finish or be interrupted.
async fn supervise(orchestrator: &mut Orchestrator, args: &Args) -> Result<()> {
    orchestrator.launch(&args.app_id)?;

    let configs: HashMap<String, String> = args.gateway_configs.iter().cloned().collect();
    match orchestrator.update(&configs) {
        Ok(report) if report.is_clean() => info!("Gateways ready, application started"),
        Ok(report) => warn!(
            failures = report.failures.len(),
            unknown = report.unknown.len(),
            "Application started with degraded gateways"
        ),
        Err(e) => error!("Update failed: {e}"),
    }

    wait_for_exit(orchestrator).await
}

/// Returns on Ctrl-C, SIGTERM, or once the supervised child has exited.
async fn wait_for_exit(orchestrator: &mut Orchestrator) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).into_diagnostic()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(CHILD_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Some(outcome) = orchestrator.poll_child()? {
                    info!("Container {outcome}, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_config() {
        assert_eq!(
            parse_gateway_config("network=10.0.0.5/24").unwrap(),
            ("network".to_string(), "10.0.0.5/24".to_string())
        );
        assert_eq!(
            parse_gateway_config(r#"pulseaudio={"audio": true}"#).unwrap().1,
            r#"{"audio": true}"#
        );
        assert!(parse_gateway_config("network").is_err());
        assert!(parse_gateway_config("=x").is_err());
    }

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::parse_from([
            "pelagicontain",
            "/tmp/c1",
            "/controller/controller",
            "cookie",
            "--gateway-config",
            "network=10.0.0.5/24",
            "--shared-mounts-dir",
            "/tmp/shared",
            "--strict-gateways",
            "--reap-timeout",
            "3",
        ]);
        let config = args.orchestrator_config();

        assert_eq!(args.gateway_configs.len(), 1);
        assert_eq!(config.shared_mounts_dir, PathBuf::from("/tmp/shared"));
        assert_eq!(config.activation_policy, ActivationPolicy::Strict);
        assert_eq!(config.reap_timeout, Some(Duration::from_secs(3)));
    }
}
