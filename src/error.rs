//! Contains the `Error` and `Result` types used throughout the crate.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::options::ServerAddress;

/// Retryable write error label. Added to an error when the failed write may be
/// safely retried.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. Added to network and server-selection
/// errors that occur during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result error label. Added to errors where it is
/// unknown whether a commit satisfied its write concern.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all fallible methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while talking to the server. The inner [`ErrorKind`]
/// is boxed to keep the type small, and the whole error is cloneable so it can
/// be fanned out to every waiter on a failed connection.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_frame(message: impl Into<String>) -> Error {
        ErrorKind::InvalidFrame {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn stream_closed(message: impl Into<String>) -> Error {
        ErrorKind::StreamClosed {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn timeout(phase: TimeoutPhase, message: impl Into<String>) -> Error {
        ErrorKind::Timeout {
            phase,
            message: message.into(),
        }
        .into()
    }

    /// Creates an authentication error for the given mechanism with the
    /// provided reason.
    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    /// Creates an authentication error for the given mechanism when the server
    /// response is malformed.
    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid server response")
    }

    /// Creates an authentication error for the given mechanism with a generic
    /// "internal error" message.
    pub(crate) fn unknown_authentication_error(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "internal error")
    }

    pub(crate) fn pool_timeout(address: &ServerAddress) -> Error {
        ErrorKind::PoolTimeout {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn pool_closed(address: &ServerAddress) -> Error {
        ErrorKind::PoolClosed {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// The labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error carries the given label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// Whether this error was caused by a failure of the underlying transport.
    /// Sessions observed via such an error must be marked dirty.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::StreamClosed { .. } | ErrorKind::Timeout { .. }
        )
    }

    /// Whether this error was caused by an expired deadline.
    pub fn is_timeout(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Timeout { .. } => true,
            ErrorKind::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_pool_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolTimeout { .. })
    }

    /// The server error code, if this error originated from the server.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(wce)) => Some(wce.code),
            ErrorKind::Write(WriteFailure::WriteError(we)) => Some(we.code),
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error: Some(wce),
                ..
            }) => Some(wce.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.code()))
    }

    /// For sensitive commands, everything but the error labels, code, and code
    /// name must be scrubbed from errors before they reach monitoring.
    pub(crate) fn redact(&mut self) {
        match *self.kind {
            ErrorKind::Command(ref mut command_error) => command_error.redact(),
            ErrorKind::Write(ref mut write_failure) => match write_failure {
                WriteFailure::WriteConcernError(wce) => wce.redact(),
                WriteFailure::WriteError(we) => we.redact(),
            },
            ErrorKind::BulkWrite(ref mut bwe) => {
                if let Some(ref mut write_errors) = bwe.write_errors {
                    for we in write_errors {
                        we.redact();
                    }
                }
                if let Some(ref mut wce) = bwe.write_concern_error {
                    wce.redact();
                }
            }
            _ => {}
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(Arc::new(err))
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(Arc::new(err))
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The point during an operation at which a deadline expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeoutPhase {
    /// Establishing the TCP (and possibly TLS) connection.
    Connect,
    /// Reading a reply from an established connection.
    Read,
    /// Writing a message to an established connection.
    Write,
    /// The overall operation deadline.
    Operation,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Read => "read",
            TimeoutPhase::Write => "write",
            TimeoutPhase::Operation => "operation",
        };
        f.write_str(s)
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A wire frame violated a framing invariant: bad header, unexpected
    /// opcode, an over- or undersized message, or a negative document count.
    #[error("Invalid wire frame: {message}")]
    #[non_exhaustive]
    InvalidFrame { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An operation was attempted on a stream that has already been closed.
    #[error("Stream closed: {message}")]
    #[non_exhaustive]
    StreamClosed { message: String },

    /// A deadline expired. The phase distinguishes connect, read, write, and
    /// overall operation timeouts.
    #[error("Timed out during {phase}: {message}")]
    #[non_exhaustive]
    Timeout {
        phase: TimeoutPhase,
        message: String,
    },

    /// Authenticating a connection failed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// The hello exchange or post-hello negotiation failed.
    #[error("Handshake failed: {message}")]
    #[non_exhaustive]
    Handshake { message: String },

    /// A connection check-out did not complete within the pool's wait deadline.
    #[error("Timed out while checking out a connection from the pool for {address}")]
    #[non_exhaustive]
    PoolTimeout { address: ServerAddress },

    /// The pool was used after shutdown.
    #[error("The connection pool for {address} has been closed")]
    #[non_exhaustive]
    PoolClosed { address: ServerAddress },

    /// The server returned `ok: 0` with a structured error.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred when executing a single write.
    #[error("A write operation failed: {0:?}")]
    Write(WriteFailure),

    /// An error occurred when executing a batch of writes.
    #[error("A bulk write operation failed: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The server returned a reply that could not be interpreted.
    #[error("Invalid server reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// An invalid argument was provided by the caller.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred during a transaction state change.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// Resolving the server hostname failed or produced no endpoints.
    #[error("DNS resolution failed: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    /// The TLS configuration was invalid.
    #[error("Invalid TLS configuration: {message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// The connected deployment does not support sessions.
    #[error("Attempted to start a session against a deployment that does not support sessions")]
    SessionsNotSupported,

    /// Wrapper around [`bson::de::Error`].
    #[error("{0}")]
    BsonDeserialization(Arc<bson::de::Error>),

    /// Wrapper around [`bson::ser::Error`].
    #[error("{0}")]
    BsonSerialization(Arc<bson::ser::Error>),

    /// An invariant was violated; always indicates a bug in this crate.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

/// An error returned by the server in response to a command.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl CommandError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// The shape of an `ok: 0` reply body.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(flatten)]
    pub(crate) command_error: CommandError,

    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Error {
        Error::new(ErrorKind::Command(body.command_error), body.error_labels)
    }
}

/// An error that occurred while the server applied a single write.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl WriteError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
    }
}

/// An error that occurred while applying one write of a batch; carries the
/// index of the failed write within the batch.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the batch of the write that failed.
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl BulkWriteError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
    }
}

/// An error that occurred due to the server not being able to satisfy a write
/// concern.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl WriteConcernError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
    }
}

/// The set of errors that a single write can fail with.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// The write concern was not satisfied.
    WriteConcernError(WriteConcernError),

    /// The write itself failed.
    WriteError(WriteError),
}

/// The aggregate failure of a batch of writes: the per-index error array plus
/// an optional write concern error.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The errors that occurred for individual writes, if any.
    pub write_errors: Option<Vec<BulkWriteError>>,

    /// The write concern error, if any.
    pub write_concern_error: Option<WriteConcernError>,
}
