//! Events describing the lifecycle of individual commands.

use std::{sync::Arc, time::Duration};

use bson::Document;
use derive_where::derive_where;

use crate::{conn::ConnectionInfo, error::Error};

/// An event emitted just before a command is written to a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command document. Empty for security-sensitive commands.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The name of the command, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier of the request; pairs this event with
    /// its succeeded or failed counterpart.
    pub request_id: i32,

    /// The driver-generated identifier of the logical operation this command
    /// belongs to.
    pub operation_id: i32,

    /// Information about the connection the command is sent on.
    pub connection: ConnectionInfo,
}

/// An event emitted after a command's reply has been decoded and found
/// successful.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command, including the network round
    /// trip.
    pub duration: Duration,

    /// The server's reply. Empty for security-sensitive commands.
    pub reply: Document,

    /// The name of the command.
    pub command_name: String,

    /// The driver-generated identifier of the request.
    pub request_id: i32,

    /// The driver-generated identifier of the logical operation.
    pub operation_id: i32,

    /// Information about the connection the command was sent on.
    pub connection: ConnectionInfo,
}

/// An event emitted when a command fails, whether on the wire or via an
/// `ok: 0` reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command.
    pub duration: Duration,

    /// The name of the command.
    pub command_name: String,

    /// The error the command failed with. Redacted for security-sensitive
    /// commands.
    pub failure: Error,

    /// The driver-generated identifier of the request.
    pub request_id: i32,

    /// The driver-generated identifier of the logical operation.
    pub operation_id: i32,

    /// Information about the connection the command was sent on.
    pub connection: ConnectionInfo,
}

/// Applications implement this trait to observe every command the driver
/// sends. A failure event is always delivered before the corresponding error
/// is returned to the caller, except when monitoring was suppressed for a
/// security-sensitive exchange.
pub trait CommandEventHandler: Send + Sync {
    /// Called when a command is about to be written to a connection.
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    /// Called when a command's reply was decoded successfully.
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    /// Called when a command failed.
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

#[derive(Clone, Debug)]
pub(crate) enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

/// Fans command events out to the registered handler, if any. The closure form
/// keeps event construction (document clones in particular) off the hot path
/// when nobody is listening.
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct CommandEventEmitter {
    #[derive_where(skip)]
    handler: Option<Arc<dyn CommandEventHandler>>,
}

impl CommandEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn CommandEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        if let Some(ref handler) = self.handler {
            match generate_event() {
                CommandEvent::Started(event) => handler.handle_command_started_event(event),
                CommandEvent::Succeeded(event) => handler.handle_command_succeeded_event(event),
                CommandEvent::Failed(event) => handler.handle_command_failed_event(event),
            }
        }
    }
}
