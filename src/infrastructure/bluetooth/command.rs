//! Command Dispatcher
//!
//! One-shot commands for the glasses. A command with an argument writes the
//! argument to the file-name channel first, then the command to command-in.

use crate::infrastructure::bluetooth::protocol::DeviceCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub name: String,
    pub argument: Option<String>,
}

impl PendingCommand {
    pub fn new(command: DeviceCommand) -> Self {
        Self {
            name: command.as_str().to_string(),
            argument: None,
        }
    }

    pub fn with_argument(command: DeviceCommand, argument: impl Into<String>) -> Self {
        Self {
            name: command.as_str().to_string(),
            argument: Some(argument.into()),
        }
    }

    /// A command outside the known vocabulary, passed through verbatim.
    pub fn raw(name: impl Into<String>, argument: Option<String>) -> Self {
        Self {
            name: name.into(),
            argument,
        }
    }

    pub fn is_known(&self) -> bool {
        DeviceCommand::parse(&self.name).is_some()
    }
}
