use std::time::Duration;

use crate::{handshake::HelloReply, options::ServerAddress};

/// Information about a server and connection gathered during the handshake.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionDescription {
    /// The address this connection is connected to.
    pub server_address: ServerAddress,

    /// Whether the server reported itself writable: a primary, a router, or a
    /// standalone. Consumed by server selection in higher layers.
    pub is_writable_primary: bool,

    /// The maximum permitted size of a single document, in bytes.
    pub max_document_size: i64,

    /// The maximum permitted size of a wire message, in bytes.
    pub max_message_size_bytes: i32,

    /// The maximum number of writes permitted in one batch.
    pub max_batch_count: i64,

    /// How long the server keeps an idle session alive, or `None` if the
    /// deployment does not support sessions.
    pub logical_session_timeout: Option<Duration>,

    /// The server-generated identifier for this connection, when reported.
    pub server_connection_id: Option<i64>,

    /// The authentication mechanisms the server advertised for the
    /// pre-negotiated user, if any.
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// Whether the server accepts the `hello` command name.
    pub hello_ok: bool,
}

impl ConnectionDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            is_writable_primary: response.is_writable_primary.unwrap_or(false),
            max_document_size: response.max_bson_object_size,
            max_message_size_bytes: response.max_message_size_bytes,
            max_batch_count: response.max_write_batch_size.unwrap_or(100_000),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|minutes| Duration::from_secs(minutes as u64 * 60)),
            server_connection_id: response.connection_id,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether the server supports sessions at all.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    #[cfg(test)]
    pub(crate) fn new_testing(address: ServerAddress) -> Self {
        Self {
            server_address: address,
            is_writable_primary: true,
            max_document_size: 16 * 1024 * 1024,
            max_message_size_bytes: crate::conn::wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_batch_count: 100_000,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            server_connection_id: None,
            sasl_supported_mechs: None,
            hello_ok: true,
        }
    }
}
