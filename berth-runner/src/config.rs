//! Runner configuration
//!
//! Defines all configurable parameters for the runner: how to reach the
//! container runtime, which images every build gets, the capacity caps and
//! where build context snapshots are kept.

use std::path::PathBuf;
use std::time::Duration;

use crate::driver::CliDriverSettings;
use crate::service::capacity::{BASE_RETRY_DELAY, DEFAULT_CONSTRAINT_CAP, MAX_RETRY_DELAY};
use crate::service::provisioner::ProvisionerImages;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Container runtime binary (e.g., "docker" or "podman")
    pub runtime: String,

    /// Container runtime endpoint (e.g., "unix:///run/podman/podman.sock")
    pub runtime_host: Option<String>,

    /// Maximum time a short runtime command (inspect, create, start, rm) may take
    pub command_timeout: Duration,

    /// Image of the remoting container
    pub remoting_image: String,

    /// Image build steps run in until checkout completed
    pub scm_image: String,

    /// Maximum number of running builds for the default constraint
    pub container_cap: usize,

    /// Maximum number of running builds for any other constraint
    pub constraint_cap: usize,

    /// Constraint of jobs that do not declare one
    pub default_constraint: String,

    /// `UID:GID` build containers run as
    pub build_user: String,

    /// Temp directory of the remoting agent, inside the shared volume
    pub agent_tmp_dir: String,

    /// Agent started by the remoting container
    pub agent_jar: String,

    /// Directory holding build context snapshots
    pub state_dir: PathBuf,

    /// First delay when waiting for a capacity slot
    pub admission_base_delay: Duration,

    /// Longest delay when waiting for a capacity slot
    pub admission_max_delay: Duration,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - BERTH_RUNTIME (default: docker)
    /// - BERTH_RUNTIME_HOST
    /// - BERTH_COMMAND_TIMEOUT (seconds, default: 120)
    /// - BERTH_REMOTING_IMAGE, BERTH_SCM_IMAGE
    /// - BERTH_CONTAINER_CAP (default: 10)
    /// - BERTH_CONSTRAINT_CAP (default: 2)
    /// - BERTH_DEFAULT_CONSTRAINT (default: default)
    /// - BERTH_BUILD_USER (default: 10000:10000)
    /// - BERTH_AGENT_TMP_DIR, BERTH_AGENT_JAR
    /// - BERTH_STATE_DIR (default: /tmp/berth)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let string = |name: &str, default: String| std::env::var(name).unwrap_or(default);

        let number = |name: &str, default: usize| -> anyhow::Result<usize> {
            match std::env::var(name) {
                Ok(value) => value
                    .parse::<usize>()
                    .map_err(|e| anyhow::anyhow!("{} must be a number: {}", name, e)),
                Err(_) => Ok(default),
            }
        };

        let command_timeout = Duration::from_secs(
            number("BERTH_COMMAND_TIMEOUT", defaults.command_timeout.as_secs() as usize)? as u64,
        );

        Ok(Self {
            runtime: string("BERTH_RUNTIME", defaults.runtime),
            runtime_host: std::env::var("BERTH_RUNTIME_HOST")
                .ok()
                .filter(|host| !host.trim().is_empty()),
            command_timeout,
            remoting_image: string("BERTH_REMOTING_IMAGE", defaults.remoting_image),
            scm_image: string("BERTH_SCM_IMAGE", defaults.scm_image),
            container_cap: number("BERTH_CONTAINER_CAP", defaults.container_cap)?,
            constraint_cap: number("BERTH_CONSTRAINT_CAP", defaults.constraint_cap)?,
            default_constraint: string("BERTH_DEFAULT_CONSTRAINT", defaults.default_constraint),
            build_user: string("BERTH_BUILD_USER", defaults.build_user),
            agent_tmp_dir: string("BERTH_AGENT_TMP_DIR", defaults.agent_tmp_dir),
            agent_jar: string("BERTH_AGENT_JAR", defaults.agent_jar),
            state_dir: std::env::var("BERTH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            admission_base_delay: defaults.admission_base_delay,
            admission_max_delay: defaults.admission_max_delay,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.trim().is_empty() {
            anyhow::bail!("runtime cannot be empty");
        }

        if self.remoting_image.trim().is_empty() || self.scm_image.trim().is_empty() {
            anyhow::bail!("remoting and scm images cannot be empty");
        }

        if self.container_cap == 0 {
            anyhow::bail!("container_cap must be greater than 0");
        }

        if self.constraint_cap == 0 {
            anyhow::bail!("constraint_cap must be greater than 0");
        }

        if self.default_constraint.trim().is_empty() {
            anyhow::bail!("default_constraint cannot be empty");
        }

        if self.command_timeout.as_secs() == 0 {
            anyhow::bail!("command_timeout must be greater than 0");
        }

        let numeric_user = self
            .build_user
            .split_once(':')
            .is_some_and(|(uid, gid)| uid.parse::<u32>().is_ok() && gid.parse::<u32>().is_ok());
        if !numeric_user {
            anyhow::bail!("build_user must be a numeric UID:GID pair");
        }

        if self.admission_base_delay > self.admission_max_delay {
            anyhow::bail!("admission_base_delay cannot exceed admission_max_delay");
        }

        Ok(())
    }

    /// Command the remoting container runs
    pub fn remoting_command(&self) -> Vec<String> {
        vec![
            "java".to_string(),
            format!("-Djava.io.tmpdir={}", self.agent_tmp_dir),
            "-jar".to_string(),
            self.agent_jar.clone(),
        ]
    }

    pub fn driver_settings(&self) -> CliDriverSettings {
        CliDriverSettings {
            binary: self.runtime.clone(),
            host: self.runtime_host.clone(),
            command_timeout: Some(self.command_timeout),
            build_user: self.build_user.clone(),
            remoting_command: self.remoting_command(),
        }
    }

    pub fn images(&self) -> ProvisionerImages {
        ProvisionerImages {
            remoting: self.remoting_image.clone(),
            scm: self.scm_image.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            runtime_host: None,
            command_timeout: Duration::from_secs(120),
            remoting_image: "jenkins/inbound-agent:latest".to_string(),
            scm_image: "buildpack-deps:scm".to_string(),
            container_cap: 10,
            constraint_cap: DEFAULT_CONSTRAINT_CAP,
            default_constraint: "default".to_string(),
            build_user: "10000:10000".to_string(),
            agent_tmp_dir: "/home/jenkins/.tmp".to_string(),
            agent_jar: "/usr/share/jenkins/agent.jar".to_string(),
            state_dir: PathBuf::from("/tmp/berth"),
            admission_base_delay: BASE_RETRY_DELAY,
            admission_max_delay: MAX_RETRY_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.constraint_cap, 2);
        assert_eq!(config.admission_base_delay, Duration::from_millis(2000));
        assert_eq!(config.admission_max_delay, Duration::from_millis(60000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.container_cap = 0;
        assert!(config.validate().is_err());
        config.container_cap = 4;

        config.build_user = "jenkins".to_string();
        assert!(config.validate().is_err());
        config.build_user = "1000:abc".to_string();
        assert!(config.validate().is_err());
        config.build_user = "1000:1000".to_string();

        config.runtime = String::new();
        assert!(config.validate().is_err());
        config.runtime = "podman".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remoting_command_uses_agent_settings() {
        let config = Config {
            agent_tmp_dir: "/home/agent/.tmp".to_string(),
            agent_jar: "/opt/agent.jar".to_string(),
            ..Config::default()
        };

        assert_eq!(
            config.remoting_command(),
            vec!["java", "-Djava.io.tmpdir=/home/agent/.tmp", "-jar", "/opt/agent.jar"]
        );
        assert_eq!(config.driver_settings().remoting_command, config.remoting_command());
    }
}
