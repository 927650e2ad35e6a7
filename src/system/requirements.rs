//! Host requirements checking implementation.

use std::env;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::container::RuntimePrograms;
use crate::error::{Result, SystemRequirementsError};
use crate::orchestrator::OrchestratorConfig;

/// Resolved locations of everything the orchestrator executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRequirements {
    /// Shell that runs phase commands
    pub shell: Option<PathBuf>,
    /// Create phase program
    pub create: PathBuf,
    /// Execute phase program
    pub execute: PathBuf,
    /// Destroy phase program
    pub destroy: PathBuf,
}

/// Check the shell and the runtime programs named by `config`.
///
/// # Errors
///
/// Returns `SystemRequirementsError::ProgramNotFound` for the first program
/// that cannot be resolved.
pub fn check_all(config: &OrchestratorConfig) -> Result<RuntimeRequirements> {
    let shell = resolve(config.shell.as_os_str())?;
    let mut requirements = check_runtime(&config.runtime)?;
    requirements.shell = Some(shell);
    Ok(requirements)
}

/// Check that the three runtime programs can be executed.
///
/// Bare names are looked up on `PATH`; anything containing a slash is
/// checked as given.
///
/// # Errors
///
/// Returns `SystemRequirementsError::ProgramNotFound` for the first program
/// that cannot be resolved.
#[instrument]
pub fn check_runtime(runtime: &RuntimePrograms) -> Result<RuntimeRequirements> {
    let create = resolve(OsStr::new(&runtime.create))?;
    let execute = resolve(OsStr::new(&runtime.execute))?;
    let destroy = resolve(OsStr::new(&runtime.destroy))?;

    debug!(
        create = %create.display(),
        execute = %execute.display(),
        destroy = %destroy.display(),
        "Runtime programs resolved"
    );
    Ok(RuntimeRequirements {
        shell: None,
        create,
        execute,
        destroy,
    })
}

/// Resolve a program name the way the shell would.
///
/// Returns `None` if no executable file is found.
#[must_use]
pub fn find_program(program: &OsStr) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.as_encoded_bytes().contains(&b'/') {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(candidate))
        .find(|full| is_executable(full))
}

fn resolve(program: &OsStr) -> Result<PathBuf> {
    find_program(program).ok_or_else(|| {
        SystemRequirementsError::ProgramNotFound {
            program: program.to_string_lossy().to_string(),
        }
        .into()
    })
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
