//! Runtime command lines
//!
//! Builds the argument list of a container runtime invocation and renders it
//! for logging with secret arguments redacted.

use berth_core::domain::process::CommandArg;
use std::process::Stdio;
use tokio::process::Command;

/// One invocation of the container runtime binary
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    program: String,
    host: Option<String>,
    args: Vec<CommandArg>,
}

impl RuntimeCommand {
    pub fn new(program: impl Into<String>, host: Option<String>) -> Self {
        Self {
            program: program.into(),
            host,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::plain(arg));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(CommandArg::plain));
        self
    }

    /// Appends arguments keeping their masking flags
    pub fn command_args<'a>(mut self, args: impl IntoIterator<Item = &'a CommandArg>) -> Self {
        self.args.extend(args.into_iter().cloned());
        self
    }

    /// Subcommand name (`create`, `start`, ...) used in error messages
    pub fn subcommand(&self) -> &str {
        self.args.first().map(|arg| arg.value.as_str()).unwrap_or("")
    }

    /// Real argument values, secrets included
    #[cfg(test)]
    pub fn arg_values(&self) -> Vec<&str> {
        self.args.iter().map(|arg| arg.value.as_str()).collect()
    }

    /// Builds the process to spawn, with stdio closed by default
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args.iter().map(|arg| &arg.value));

        if let Some(host) = &self.host {
            command.env("DOCKER_HOST", host).env("CONTAINER_HOST", host);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl std::fmt::Display for RuntimeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.display_value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_redacts_masked_args() {
        let secret = CommandArg::masked("hunter2");
        let command = RuntimeCommand::new("docker", None)
            .args(["create", "alpine"])
            .command_args([&CommandArg::plain("login"), &secret]);

        assert_eq!(command.to_string(), "docker create alpine login ********");
        assert_eq!(
            command.arg_values(),
            vec!["create", "alpine", "login", "hunter2"]
        );
    }

    #[test]
    fn test_subcommand() {
        let command = RuntimeCommand::new("podman", None).args(["rm", "abc"]);
        assert_eq!(command.subcommand(), "rm");
        assert_eq!(RuntimeCommand::new("podman", None).subcommand(), "");
    }
}
