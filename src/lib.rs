//! Pelagicontain - lifecycle orchestration for sandboxed application containers.
//!
//! This crate launches, configures and tears down a single application
//! container on an LXC-style runtime. Host resources reach the container only
//! through gateways (network, PulseAudio, D-Bus), which are configured and
//! activated once the application has been registered.
//!
//! # Host Requirements
//!
//! - Linux
//! - LXC userspace tools (`lxc-create`, `lxc-execute`, `lxc-destroy`) on `PATH`
//! - `/bin/sh`
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use pelagicontain::orchestrator::{
//!     FifoController, LoggingAuthority, Orchestrator, OrchestratorConfig,
//! };
//!
//! fn main() -> miette::Result<()> {
//!     let config = OrchestratorConfig::default();
//!     pelagicontain::system::check_all(&config)?;
//!
//!     let root = std::path::Path::new("/var/am/container");
//!     let mut orchestrator = Orchestrator::new(
//!         config,
//!         Box::new(FifoController::new(root)),
//!         Box::new(LoggingAuthority),
//!     );
//!
//!     orchestrator.initialize(root, "/etc/pelagicontain")?;
//!     orchestrator.run("/controller/controller", "cookie")?;
//!     orchestrator.launch("com.example.player")?;
//!     orchestrator.update(&HashMap::new())?;
//!
//!     let report = orchestrator.shutdown()?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod container;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod system;

// Re-export commonly used types
pub use container::{Container, ExitOutcome, RuntimePrograms};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayKind, GatewayState};
pub use orchestrator::{
    ActivationPolicy, Orchestrator, OrchestratorConfig, ShutdownReport, UpdateReport,
};
