//! Container model and runtime process plumbing.
//!
//! A container is described by three opaque shell commands for the underlying
//! LXC-style runtime:
//!
//! - **create** allocates the container (run synchronously)
//! - **execute** runs the contained workload (run in a supervised child)
//! - **destroy** releases the container (run by the same child once execute returns)
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use pelagicontain::container::{Container, RuntimePrograms};
//!
//! let container = Container::new("pelagicontain-demo", "/etc/pelagicontain");
//! let commands = container
//!     .commands("/bin/app", &[], Path::new("/tmp/c1/rootfs/"), &RuntimePrograms::default(), 4096)
//!     .unwrap();
//!
//! assert!(commands.create.starts_with("lxc-create -n pelagicontain-demo"));
//! assert!(commands.execute.ends_with("-- /bin/app"));
//! ```

mod container;
mod runtime;
mod workspace;

pub use container::{Container, PhaseCommands};
pub use runtime::{
    ExitOutcome, Phase, Reaped, RuntimePrograms, SupervisedProcess, run_phase, spawn_supervised,
};
pub use workspace::Workspace;
