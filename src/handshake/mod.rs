//! The `hello` exchange that opens every connection: client metadata,
//! compression and mechanism negotiation, and speculative authentication.

pub(crate) mod metadata;
#[cfg(test)]
mod test;

use bson::{doc, Document};
use serde::Deserialize;

use self::metadata::ClientMetadata;
use crate::{
    auth::{AuthMechanism, ClientFirst, Credential},
    compression::Compressor,
    conn::{Command, ConnectionDescription, InternalConnection},
    error::{ErrorKind, Result},
    options::{DriverInfo, ServerAddress, ServerApi},
    session::ClusterTime,
};

/// Constructs the hello command for a handshake.
pub(crate) fn hello_command(server_api: Option<&ServerApi>) -> Command {
    let mut command = Command::new("hello", "admin", doc! { "hello": 1 });
    if let Some(server_api) = server_api {
        command.set_server_api(server_api);
    }
    command
}

/// A decoded hello reply.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The body of a reply to a hello command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable: a primary, a router, or a standalone.
    pub(crate) is_writable_primary: Option<bool>,

    /// Whether the server accepts the `hello` command name for monitoring.
    pub(crate) hello_ok: Option<bool>,

    /// The compressors the server supports, of those the client listed.
    #[serde(rename = "compression")]
    pub(crate) compressors: Option<Vec<String>>,

    /// How many minutes a session stays alive after its last use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// The maximum permitted size of a single document, in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of writes permitted in one batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// The maximum permitted size of a wire message, in bytes.
    #[serde(default = "default_max_message_size_bytes")]
    pub(crate) max_message_size_bytes: i32,

    /// The SASL mechanisms available for the pre-negotiated user.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The server's reply to speculative authentication, if it engaged.
    pub(crate) speculative_authenticate: Option<Document>,

    /// The server-generated identifier for the connection.
    pub(crate) connection_id: Option<i64>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48 * 1024 * 1024
}

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send, identical for every connection this
    /// handshaker opens apart from per-credential additions.
    command: Command,

    compressors: Option<Vec<Compressor>>,

    metadata: ClientMetadata,
}

/// Options for creating a [`Handshaker`].
#[derive(Clone, Debug, Default)]
pub struct HandshakerOptions {
    /// The application name reported to the server. At most 128 bytes.
    pub app_name: Option<String>,

    /// The compressors to offer the server, in preference order.
    pub compressors: Option<Vec<Compressor>>,

    /// Info about a library wrapping this driver, appended to the metadata.
    pub driver_info: Option<DriverInfo>,

    /// The declared server API, attached to the handshake and every command.
    pub server_api: Option<ServerApi>,
}

impl Handshaker {
    /// Creates a new handshaker. Fails if the application name is over the
    /// length limit.
    pub(crate) fn new(options: HandshakerOptions) -> Result<Self> {
        let mut metadata = ClientMetadata::new(options.app_name)?;
        if let Some(ref driver_info) = options.driver_info {
            metadata.append_driver_info(driver_info);
        }

        let mut command = hello_command(options.server_api.as_ref());

        if let Some(ref compressors) = options.compressors {
            command.body.insert(
                "compression",
                compressors
                    .iter()
                    .map(|compressor| compressor.name())
                    .collect::<Vec<_>>(),
            );
        }

        Ok(Self {
            command,
            compressors: options.compressors,
            metadata,
        })
    }

    fn build_command(
        &self,
        credential: Option<&Credential>,
    ) -> Result<(Command, Option<ClientFirst>)> {
        let mut command = self.command.clone();

        let client_first = match credential {
            Some(credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);

                // SCRAM-SHA-256 is assumed when no mechanism was configured;
                // servers too old for speculative authentication simply
                // ignore the field.
                let mechanism = credential
                    .mechanism
                    .clone()
                    .unwrap_or(AuthMechanism::ScramSha256);
                let client_first = mechanism.build_speculative_client_first(credential)?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .insert("speculativeAuthenticate", client_first.to_document());
                }
                client_first
            }
            None => None,
        };

        command
            .body
            .insert("client", self.metadata.to_document_within_budget());

        Ok((command, client_first))
    }

    /// Handshakes a connection: sends the hello, records the resulting
    /// description on the connection, negotiates compression, and runs
    /// authentication.
    pub(crate) async fn handshake(
        &self,
        conn: &InternalConnection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let (command, client_first) = self.build_command(credential)?;

        let response = conn.send_command(command, None).await?;
        if !response.is_success() {
            let failure = response.into_command_failure();
            return Err(ErrorKind::Handshake {
                message: format!("hello failed: {}", failure),
            }
            .into());
        }

        let cluster_time = response.cluster_time();
        let mut command_response: HelloCommandResponse = response.body().map_err(|e| {
            ErrorKind::Handshake {
                message: format!("invalid hello reply: {}", e),
            }
        })?;

        // Record the client's speculative message and the server's response,
        // if the server engaged.
        let first_round = client_first.and_then(|client_first| {
            command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        if let (Some(server_compressors), Some(client_compressors)) = (
            command_response.compressors.as_ref(),
            self.compressors.as_ref(),
        ) {
            // Use the first client compressor the server also supports.
            if let Some(compressor) = client_compressors.iter().find(|client_compressor| {
                server_compressors
                    .iter()
                    .any(|server_compressor| client_compressor.name() == server_compressor)
            }) {
                conn.set_compressor(compressor.clone()).await;
            }
        }

        let reply = HelloReply {
            server_address: conn.address().clone(),
            command_response,
            cluster_time,
        };

        conn.mark_opened(ConnectionDescription::from_hello_reply(&reply));

        if let Some(credential) = credential {
            credential.authenticate_stream(conn, first_round).await?;
        }

        Ok(reply)
    }
}
