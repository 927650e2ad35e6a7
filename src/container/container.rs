//! Runtime command construction for a single container.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tracing::{instrument, trace};
use uuid::Uuid;

use super::runtime::{Phase, RuntimePrograms};
use crate::error::ContainerError;
use crate::gateway::Gateway;

/// Prefix of every generated container name.
pub const NAME_PREFIX: &str = "pelagicontain-";

/// The create, execute and destroy commands for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCommands {
    /// Allocates the container.
    pub create: String,
    /// Runs the contained command; returns when the workload exits.
    pub execute: String,
    /// Releases everything the create phase allocated.
    pub destroy: String,
}

impl PhaseCommands {
    /// Returns the commands paired with their phase, in execution order.
    #[must_use]
    pub fn iter(&self) -> [(Phase, &str); 3] {
        [
            (Phase::Create, self.create.as_str()),
            (Phase::Execute, self.execute.as_str()),
            (Phase::Destroy, self.destroy.as_str()),
        ]
    }
}

/// A sandboxed execution target.
///
/// The name is fixed at construction. Command generation reads only the
/// arguments and the container's own attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    name: String,
    config_file: PathBuf,
}

impl Container {
    /// Creates a container description with an explicit name.
    #[must_use]
    pub fn new(name: impl Into<String>, config_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            config_file: config_file.into(),
        }
    }

    /// Creates a container description with a freshly generated unique name.
    #[must_use]
    pub fn with_generated_name(config_file: impl Into<PathBuf>) -> Self {
        Self::new(Self::generate_name(), config_file)
    }

    /// Generates a unique container name usable as an LXC identifier.
    #[must_use]
    pub fn generate_name() -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{NAME_PREFIX}{}", &id[..12])
    }

    /// Returns the container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the runtime configuration file path.
    #[must_use]
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Builds the three runtime commands.
    ///
    /// Gateways contribute runtime overrides (rendered as `-s key=value`,
    /// duplicates dropped) and environment variables for the contained
    /// process.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `ContainerError::EmptyCommand` if `contained_command` is blank
    /// - `ContainerError::CommandTooLong` if any generated command exceeds `max_len` bytes
    #[instrument(skip(self, gateways, runtime), fields(container = %self.name, gateways = gateways.len()))]
    pub fn commands(
        &self,
        contained_command: &str,
        gateways: &[Box<dyn Gateway>],
        app_root: &Path,
        runtime: &RuntimePrograms,
        max_len: usize,
    ) -> Result<PhaseCommands, ContainerError> {
        let contained_command = contained_command.trim();
        if contained_command.is_empty() {
            return Err(ContainerError::EmptyCommand {
                container: self.name.clone(),
            });
        }

        let name = shell_quote(&self.name);

        let create = format!(
            "{} -n {} -t none -f {}",
            shell_quote(&runtime.create),
            name,
            shell_quote(&self.config_file.to_string_lossy())
        );

        let mut overrides: Vec<String> = Vec::new();
        let mut environment: Vec<(String, String)> = Vec::new();
        for gateway in gateways {
            for item in gateway.runtime_overrides() {
                if !overrides.contains(&item) {
                    overrides.push(item);
                }
            }
            environment.extend(gateway.environment());
        }

        let mut execute = format!(
            "{} -n {} -f {} -s {}",
            shell_quote(&runtime.execute),
            name,
            shell_quote(&self.config_file.to_string_lossy()),
            shell_quote(&format!("lxc.rootfs={}", app_root.display()))
        );
        for item in &overrides {
            execute.push_str(" -s ");
            execute.push_str(&shell_quote(item));
        }
        execute.push_str(" --");
        if !environment.is_empty() {
            execute.push_str(" env");
            for (key, value) in &environment {
                execute.push(' ');
                execute.push_str(&shell_quote(&format!("{key}={value}")));
            }
        }
        execute.push(' ');
        execute.push_str(contained_command);

        let destroy = format!("{} -n {}", shell_quote(&runtime.destroy), name);

        let commands = PhaseCommands {
            create,
            execute,
            destroy,
        };

        for (phase, command) in commands.iter() {
            if command.len() > max_len {
                return Err(ContainerError::CommandTooLong {
                    container: self.name.clone(),
                    phase,
                    length: command.len(),
                    limit: max_len,
                });
            }
        }

        trace!(
            overrides = overrides.len(),
            env_vars = environment.len(),
            "Generated runtime commands"
        );
        Ok(commands)
    }
}

/// Quotes a word for `/bin/sh` if it contains anything beyond a safe set.
fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Container {
        Container::new("pelagicontain-test", "/etc/pelagicontain")
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = Container::generate_name();
        let b = Container::generate_name();
        assert_ne!(a, b);
        assert!(a.starts_with(NAME_PREFIX));
        assert_eq!(a.len(), NAME_PREFIX.len() + 12);
    }

    #[test]
    fn test_commands_without_gateways() {
        let cmds = container()
            .commands(
                "/bin/app --flag",
                &[],
                Path::new("/tmp/c1/rootfs/"),
                &RuntimePrograms::default(),
                4096,
            )
            .unwrap();

        assert_eq!(
            cmds.create,
            "lxc-create -n pelagicontain-test -t none -f /etc/pelagicontain"
        );
        assert_eq!(
            cmds.execute,
            "lxc-execute -n pelagicontain-test -f /etc/pelagicontain -s lxc.rootfs=/tmp/c1/rootfs/ -- /bin/app --flag"
        );
        assert_eq!(cmds.destroy, "lxc-destroy -n pelagicontain-test");
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = container().commands(
            "   ",
            &[],
            Path::new("/tmp/rootfs/"),
            &RuntimePrograms::default(),
            4096,
        );
        assert!(matches!(result, Err(ContainerError::EmptyCommand { .. })));
    }

    #[test]
    fn test_command_too_long_rejected() {
        let long = format!("/bin/echo {}", "x".repeat(200));
        let result = container().commands(
            &long,
            &[],
            Path::new("/tmp/rootfs/"),
            &RuntimePrograms::default(),
            128,
        );
        match result {
            Err(ContainerError::CommandTooLong { phase, limit, .. }) => {
                assert_eq!(phase, Phase::Execute);
                assert_eq!(limit, 128);
            }
            other => panic!("expected CommandTooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.2"), "plain-word_1.2");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
