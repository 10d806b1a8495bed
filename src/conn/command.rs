use std::{collections::HashSet, sync::LazyLock};

use bson::{Bson, Document, Timestamp};
use serde::de::DeserializeOwned;

use super::wire::Message;
use crate::{
    bson_util,
    error::{CommandErrorBody, Error, ErrorKind, Result},
    options::{ReadConcern, ServerAddress, ServerApi},
    session::ClusterTime,
};

/// Command names whose documents and replies must never reach monitoring.
pub(crate) static REDACTED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// The handshake command names; a handshake that carries credential material
/// is treated as sensitive.
pub(crate) static HELLO_COMMAND_NAMES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ["hello", "ismaster"].into_iter().collect());

/// A driver-side description of a server command, containing everything
/// needed to serialize it to a wire message.
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    /// Constructs a new command with the given name, database, and body.
    pub fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            exhaust_allowed: false,
        }
    }

    /// The name of the command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database the command targets.
    pub fn target_db(&self) -> &str {
        &self.target_db
    }

    pub(crate) fn set_session_id(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcern) {
        self.body.insert("readConcern", read_concern.to_document());
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.body.insert("recoveryToken", recovery_token.clone());
    }

    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        self.body
            .insert("apiVersion", format!("{}", server_api.version));

        if let Some(strict) = server_api.strict {
            self.body.insert("apiStrict", strict);
        }

        if let Some(deprecation_errors) = server_api.deprecation_errors {
            self.body.insert("apiDeprecationErrors", deprecation_errors);
        }
    }

    /// Whether monitoring must replace this command's document with an empty
    /// one. The handshake itself is only sensitive when it carries speculative
    /// credential material.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        if HELLO_COMMAND_NAMES.contains(name.as_str()) {
            self.body.contains_key("speculativeAuthenticate")
        } else {
            REDACTED_COMMANDS.contains(name.as_str())
        }
    }

    /// Whether this command may be compressed. Handshake and credential
    /// exchanges always go uncompressed.
    pub(crate) fn should_compress(&self) -> bool {
        let name = self.name.to_lowercase();
        !REDACTED_COMMANDS.contains(name.as_str()) && !HELLO_COMMAND_NAMES.contains(name.as_str())
    }

    /// Converts this command into a wire message with the given request id.
    pub(crate) fn into_message(self, request_id: i32) -> Message {
        let mut body = self.body;
        body.insert("$db", self.target_db);

        let mut message = Message::new(body, Some(request_id));
        if self.exhaust_allowed {
            message.flags |= super::wire::MessageFlags::EXHAUST_ALLOWED;
        }
        message
    }
}

/// A decoded server reply to a command.
///
/// Successfully producing one of these means only that the server received the
/// command and sent back a well-formed reply; whether the command itself
/// succeeded is determined by the embedded `ok` field.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub(crate) source: ServerAddress,
    pub(crate) body: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Result<Self> {
        Ok(Self {
            source,
            body: message.single_document_response()?,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_document(body: Document) -> Self {
        Self {
            source: ServerAddress {
                host: "localhost".to_string(),
                port: None,
            },
            body,
        }
    }

    /// The address of the server that sent this reply.
    pub fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    /// The reply document.
    pub fn raw_body(&self) -> &Document {
        &self.body
    }

    /// The `ok` field, coerced from whichever numeric type the server used.
    /// `None` means the reply is missing the field entirely.
    pub(crate) fn ok(&self) -> Option<i64> {
        self.body.get("ok").and_then(bson_util::get_int)
    }

    pub(crate) fn is_success(&self) -> bool {
        self.ok() == Some(1)
    }

    /// The `$clusterTime` the server gossipped in this reply.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get("$clusterTime")
            .and_then(|ct| bson::from_bson(ct.clone()).ok())
    }

    /// The `operationTime` the server reported for this command.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        match self.body.get("operationTime") {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// The opaque transaction recovery token, if the server supplied one.
    pub(crate) fn recovery_token(&self) -> Option<&Document> {
        match self.body.get("recoveryToken") {
            Some(Bson::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    /// The `atClusterTime` the server chose for a snapshot read.
    pub(crate) fn at_cluster_time(&self) -> Option<Timestamp> {
        match self
            .body
            .get_document("cursor")
            .unwrap_or(&self.body)
            .get("atClusterTime")
        {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Deserializes the reply body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.body.clone()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// Interprets an `ok: 0` reply as a structured command error.
    pub(crate) fn into_command_failure(self) -> Error {
        match self.body::<CommandErrorBody>() {
            Ok(error_response) => error_response.into(),
            Err(e) => Error::from(ErrorKind::InvalidResponse {
                message: format!("error deserializing command error: {}", e),
            }),
        }
    }
}
