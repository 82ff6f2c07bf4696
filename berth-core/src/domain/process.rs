//! Process-start specification and results
//!
//! A `ProcStart` is what the step-execution layer asks to run: a working
//! directory and an argument list in which individual arguments may be
//! flagged as secret so they never show up in logs.

use serde::{Deserialize, Serialize};

/// Replacement text for masked arguments
pub const MASK: &str = "********";

/// One command-line argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArg {
    pub value: String,
    #[serde(default)]
    pub masked: bool,
}

impl CommandArg {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            masked: false,
        }
    }

    pub fn masked(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            masked: true,
        }
    }

    /// Value as it may appear in logs
    pub fn display_value(&self) -> &str {
        if self.masked { MASK } else { &self.value }
    }
}

/// A command to run inside a build container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStart {
    /// Working directory inside the container
    pub workdir: String,

    /// Command line, program first
    pub args: Vec<CommandArg>,
}

impl ProcStart {
    /// Creates a specification with no masked arguments
    pub fn new<I, S>(workdir: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workdir: workdir.into(),
            args: args.into_iter().map(CommandArg::plain).collect(),
        }
    }

    /// Applies a mask list to the arguments
    ///
    /// The list is positional; arguments past its end stay unmasked.
    pub fn with_masks(mut self, masks: &[bool]) -> Self {
        for (arg, masked) in self.args.iter_mut().zip(masks) {
            arg.masked = *masked;
        }
        self
    }

    /// Command line with masked arguments redacted
    pub fn display_command(&self) -> String {
        self.args
            .iter()
            .map(CommandArg::display_value)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of running a build container to completion
///
/// The container's output is streamed to the caller's sink while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerExit {
    pub exit_code: i32,
}

impl ContainerExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
