//! Contracts with the processes the orchestrator talks to but does not own.
//!
//! The in-container Controller starts and stops the application. The
//! registration authority tracks which client a container was launched for.
//! Both are reached through object-safe traits so the orchestrator can be
//! driven by fakes in tests and by the shipped implementations here.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use tracing::{debug, info, instrument};

use crate::error::CollaboratorError;

/// The agent inside the container that starts and stops the application.
pub trait Controller: Send {
    /// Tells the Controller to start the contained application.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Controller` if the call could not be delivered.
    fn start_app(&mut self) -> Result<(), CollaboratorError>;

    /// Tells the Controller to stop the application.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Controller` if the call could not be delivered.
    fn shutdown(&mut self) -> Result<(), CollaboratorError>;
}

/// The external service that authorizes clients.
pub trait RegistrationAuthority: Send {
    /// Registers the client identified by `cookie` as running `app_id`.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Authority` if the call could not be delivered.
    fn register_client(&mut self, cookie: &str, app_id: &str) -> Result<(), CollaboratorError>;

    /// Reports that configuration for `app_id` has been delivered.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Authority` if the call could not be delivered.
    fn update_finished(&mut self, app_id: &str) -> Result<(), CollaboratorError>;

    /// Unregisters `app_id`.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Authority` if the call could not be delivered.
    fn unregister_client(&mut self, app_id: &str) -> Result<(), CollaboratorError>;
}

/// Name of the Controller's command FIFO under the container root.
pub const CONTROLLER_FIFO: &str = "in_fifo";

/// Controller reached through its command FIFO.
///
/// Commands are single bytes: `1` starts the application, `2` stops it. The
/// FIFO is opened non-blocking, so a Controller that is not listening shows
/// up as a delivery failure instead of a hang.
#[derive(Debug, Clone)]
pub struct FifoController {
    fifo: PathBuf,
}

impl FifoController {
    /// Creates a controller writing to `<container_root>/in_fifo`.
    #[must_use]
    pub fn new(container_root: &Path) -> Self {
        Self::with_fifo(container_root.join(CONTROLLER_FIFO))
    }

    /// Creates a controller writing to an explicit FIFO path.
    #[must_use]
    pub fn with_fifo(fifo: impl Into<PathBuf>) -> Self {
        Self { fifo: fifo.into() }
    }

    /// Returns the FIFO path.
    #[must_use]
    pub fn fifo(&self) -> &Path {
        &self.fifo
    }

    #[instrument(skip(self), fields(fifo = %self.fifo.display()))]
    fn send(&self, call: &'static str, command: &[u8]) -> Result<(), CollaboratorError> {
        let fail = |e: std::io::Error| CollaboratorError::Controller {
            call,
            reason: format!("{}: {e}", self.fifo.display()),
        };

        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.fifo)
            .map_err(fail)?;
        fifo.write_all(command).map_err(fail)?;

        debug!("Controller command delivered");
        Ok(())
    }
}

impl Controller for FifoController {
    fn start_app(&mut self) -> Result<(), CollaboratorError> {
        self.send("start_app", b"1")
    }

    fn shutdown(&mut self) -> Result<(), CollaboratorError> {
        self.send("shutdown", b"2")
    }
}

/// Registration authority that only records calls in the log.
///
/// Used when no authority service is available on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAuthority;

impl RegistrationAuthority for LoggingAuthority {
    fn register_client(&mut self, cookie: &str, app_id: &str) -> Result<(), CollaboratorError> {
        info!(cookie, app_id, "register_client");
        Ok(())
    }

    fn update_finished(&mut self, app_id: &str) -> Result<(), CollaboratorError> {
        info!(app_id, "update_finished");
        Ok(())
    }

    fn unregister_client(&mut self, app_id: &str) -> Result<(), CollaboratorError> {
        info!(app_id, "unregister_client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;

    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tempfile::TempDir;

    #[test]
    fn test_fifo_controller_writes_commands() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let fifo = temp_dir.path().join(CONTROLLER_FIFO);
        mkfifo(&fifo, Mode::S_IRWXU).expect("failed to create fifo");

        // Opening the read end non-blocking keeps the writer from seeing ENXIO.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo)
            .expect("failed to open fifo for reading");

        let mut controller = FifoController::new(temp_dir.path());
        controller.start_app().unwrap();
        controller.shutdown().unwrap();

        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        assert_eq!(received, "12");
    }

    #[test]
    fn test_fifo_without_reader_fails() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let fifo = temp_dir.path().join(CONTROLLER_FIFO);
        mkfifo(&fifo, Mode::S_IRWXU).expect("failed to create fifo");

        let mut controller = FifoController::with_fifo(&fifo);
        let err = controller.start_app().unwrap_err();
        assert!(matches!(err, CollaboratorError::Controller { call: "start_app", .. }));
    }

    #[test]
    fn test_missing_fifo_fails() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut controller = FifoController::new(temp_dir.path());
        assert!(controller.shutdown().is_err());
    }

    #[test]
    fn test_plain_file_accepts_commands() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("commands");
        File::create(&path).expect("failed to create file");

        let mut controller = FifoController::with_fifo(&path);
        controller.start_app().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn test_logging_authority_accepts_calls() {
        let mut authority = LoggingAuthority;
        authority.register_client("cookie", "app").unwrap();
        authority.update_finished("app").unwrap();
        authority.unregister_client("app").unwrap();
    }
}
