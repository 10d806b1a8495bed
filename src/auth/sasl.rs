use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};

use crate::{
    auth::AuthMechanism,
    bson_util,
    conn::Command,
    error::{Error, Result},
};

/// Builder for a `saslStart` command.
pub(super) struct SaslStart {
    source: String,
    mechanism: AuthMechanism,
    payload: Vec<u8>,
}

impl SaslStart {
    pub(super) fn new(source: String, mechanism: AuthMechanism, payload: Vec<u8>) -> Self {
        Self {
            source,
            mechanism,
            payload,
        }
    }

    pub(super) fn into_command(self) -> Command {
        let body = self.body();
        Command::new("saslStart", self.source, body)
    }

    /// The command body alone, used when the exchange is embedded in the
    /// handshake for speculative authentication.
    pub(super) fn body(&self) -> Document {
        let mut body = doc! {
            "saslStart": 1,
            "mechanism": self.mechanism.as_str(),
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.payload.clone(),
            },
        };
        if matches!(
            self.mechanism,
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256
        ) {
            body.insert("options", doc! { "skipEmptyExchange": true });
        }
        body
    }
}

/// Builder for a `saslContinue` command.
pub(super) struct SaslContinue {
    source: String,
    conversation_id: Bson,
    payload: Vec<u8>,
}

impl SaslContinue {
    pub(super) fn new(source: String, conversation_id: Bson, payload: Vec<u8>) -> Self {
        Self {
            source,
            conversation_id,
            payload,
        }
    }

    pub(super) fn into_command(self) -> Command {
        let body = doc! {
            "saslContinue": 1,
            "conversationId": self.conversation_id,
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.payload,
            },
        };

        Command::new("saslContinue", self.source, body)
    }
}

fn validate_command_success(mechanism_name: &str, response: &Document) -> Result<()> {
    let ok = match response.get("ok") {
        Some(ok) => ok,
        None => return Ok(()),
    };

    match bson_util::get_int(ok) {
        Some(1) => Ok(()),
        Some(_) => Err(Error::authentication_error(
            mechanism_name,
            response
                .get_str("errmsg")
                .unwrap_or("authentication failure"),
        )),
        _ => Err(Error::invalid_authentication_response(mechanism_name)),
    }
}

/// The parsed server half of one SASL round trip.
pub(super) struct SaslResponse {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    pub(super) payload: Vec<u8>,
}

impl SaslResponse {
    pub(super) fn parse(mechanism_name: &str, mut response: Document) -> Result<Self> {
        validate_command_success(mechanism_name, &response)?;

        let conversation_id = response
            .remove("conversationId")
            .ok_or_else(|| Error::invalid_authentication_response(mechanism_name))?;
        let done = response
            .remove("done")
            .and_then(|b| b.as_bool())
            .ok_or_else(|| Error::invalid_authentication_response(mechanism_name))?;
        let payload = response
            .get_binary_generic_mut("payload")
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))?
            .drain(..)
            .collect();

        Ok(SaslResponse {
            conversation_id,
            done,
            payload,
        })
    }
}
