//! Command service descriptions and the parsed command model.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageBody};

/// Describes a command service: its name and the commands it accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<CommandDescription>,
}

impl ServiceDescription {
    /// Finds a command description by name.
    pub fn command(&self, name: &str) -> Option<&CommandDescription> {
        self.commands.iter().find(|cmd| cmd.name == name)
    }
}

/// Describes a single command.
///
/// If `argument_positions` is non-empty the command takes positional
/// arguments in that order; `argument_trailing` marks the last position as
/// consuming the rest of the message verbatim. Otherwise arguments are given
/// as `key=value` words.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDescription {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, ArgumentDescription>,
    #[serde(default)]
    pub argument_positions: Vec<String>,
    #[serde(default)]
    pub argument_trailing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDescription {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub hint: ArgumentHint,
}

/// A type hint for argument validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentHint {
    #[default]
    Unspecified,
    /// A signed integer.
    Integer,
    /// A finite floating-point number.
    Number,
}

/// A parsed command, produced by a command parser and consumed by a service.
///
/// Arguments are kept as an ordered map so that two parses of the same
/// command compare equal regardless of the order named arguments were typed
/// in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub service: String,
    pub command: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl Command {
    /// The value of the named argument, if bound.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }
}

/// A command execution request: the parsed command plus the message that
/// carried it, so services can see who asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command: Command,
    pub message: Message,
}

/// What a service replies with. The variant dictates the reply body sent
/// back on the originating transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteResponse {
    /// Reply with a plain text body.
    Text { text: String },
    /// Reply with this exact message body.
    Body { body: MessageBody },
    /// Reply with the status string as text.
    Status { status: String },
}

impl ExecuteResponse {
    pub fn text(text: impl Into<String>) -> Self {
        ExecuteResponse::Text { text: text.into() }
    }

    /// The message body this response renders to.
    pub fn into_body(self) -> MessageBody {
        match self {
            ExecuteResponse::Text { text } => MessageBody::text(text),
            ExecuteResponse::Body { body } => body,
            ExecuteResponse::Status { status } => MessageBody::text(status),
        }
    }
}
