//! Credential types and the authentication mechanisms used to secure
//! connections.

mod plain;
mod sasl;
pub(crate) mod scram;

use std::{fmt, str::FromStr};

use bson::Document;
use derive_where::derive_where;
use serde::Deserialize;
use typed_builder::TypedBuilder;

pub(crate) use self::scram::ScramVersion;
use crate::{
    conn::{ConnectionDescription, InternalConnection},
    error::{Error, ErrorKind, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const PLAIN_STR: &str = "PLAIN";
const GSSAPI_STR: &str = "GSSAPI";
const MONGODB_AWS_STR: &str = "MONGODB-AWS";

/// The supported authentication mechanisms.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// SCRAM-SHA-1 as defined in RFC 5802.
    ScramSha1,

    /// SCRAM-SHA-256, the RFC 7677 extension of SCRAM.
    ScramSha256,

    /// SASL PLAIN, used for LDAP proxy authentication. Credentials live
    /// outside the database, so the `$external` source is used.
    Plain,

    /// Kerberos via SASL GSSAPI. Recognized but not performed by this build;
    /// the mechanism crypto lives in a higher layer.
    Gssapi,

    /// Authentication with AWS IAM credentials. Recognized but not performed
    /// by this build.
    MongoDbAws,
}

impl AuthMechanism {
    /// The mechanism's SASL name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::Plain => PLAIN_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::MongoDbAws => MONGODB_AWS_STR,
        }
    }

    /// The default source database to authenticate against when the
    /// credential does not name one.
    pub(crate) fn default_source(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => "admin",
            AuthMechanism::Plain | AuthMechanism::Gssapi | AuthMechanism::MongoDbAws => {
                "$external"
            }
        }
    }

    /// Chooses a mechanism from what the server advertised during the
    /// handshake's credential pre-negotiation.
    pub(crate) fn from_stream_description(description: &ConnectionDescription) -> AuthMechanism {
        match scram::version_from_advertised(description.sasl_supported_mechs.as_ref()) {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    /// Builds the speculative client-first payload embedded into the
    /// handshake, when the mechanism supports it.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            AuthMechanism::ScramSha1 => Ok(Some(ClientFirst::scram(
                ScramVersion::Sha1,
                credential,
            )?)),
            AuthMechanism::ScramSha256 => Ok(Some(ClientFirst::scram(
                ScramVersion::Sha256,
                credential,
            )?)),
            _ => Ok(None),
        }
    }

    /// Runs this mechanism's exchange on the given connection.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &InternalConnection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                scram::authenticate_stream(
                    conn,
                    credential,
                    ScramVersion::Sha1,
                    first_round.and_then(FirstRound::into_scram),
                )
                .await
            }
            AuthMechanism::ScramSha256 => {
                scram::authenticate_stream(
                    conn,
                    credential,
                    ScramVersion::Sha256,
                    first_round.and_then(FirstRound::into_scram),
                )
                .await
            }
            AuthMechanism::Plain => plain::authenticate_stream(conn, credential).await,
            AuthMechanism::Gssapi | AuthMechanism::MongoDbAws => Err(Error::authentication_error(
                self.as_str(),
                "mechanism is not supported by this build",
            )),
        }
    }

    /// Checks that the credential carries the pieces this mechanism needs.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 | AuthMechanism::Plain => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("no username provided for {} authentication", self),
                    }
                    .into());
                }
                if credential.password.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("no password provided for {} authentication", self),
                    }
                    .into());
                }
                Ok(())
            }
            AuthMechanism::Gssapi | AuthMechanism::MongoDbAws => Ok(()),
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            MONGODB_AWS_STR => Ok(AuthMechanism::MongoDbAws),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", s),
            }
            .into()),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's authentication credential.
#[derive(Clone, Default, TypedBuilder, PartialEq)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct Credential {
    /// The username. Unused for some mechanisms.
    pub username: Option<String>,

    /// The database to authenticate against.
    pub source: Option<String>,

    /// The password. Never printed in debug output.
    #[derive_where(skip)]
    pub password: Option<String>,

    /// The mechanism to use. When unset, the mechanism is negotiated with the
    /// server during the handshake.
    pub mechanism: Option<AuthMechanism>,

    /// Additional mechanism-specific properties.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The source database, falling back on the mechanism's default.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(|m| m.default_source())
                .unwrap_or("admin")
        })
    }

    /// Appends the mechanism-negotiation request to a handshake body when no
    /// mechanism was configured explicitly.
    pub(crate) fn append_needed_mechanism_negotiation(&self, body: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            body.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Runs the full authentication flow for this credential on a freshly
    /// handshaked connection.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &InternalConnection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let mechanism = match self.mechanism {
            Some(ref mechanism) => mechanism.clone(),
            None => {
                let description = conn.description_or_err()?;
                AuthMechanism::from_stream_description(&description)
            }
        };
        mechanism.authenticate_stream(conn, self, first_round).await
    }
}

/// The client-first message prepared for speculative authentication. The
/// message is retained because the final proof signs the whole conversation,
/// nonce included.
#[derive(Clone, Debug)]
pub(crate) enum ClientFirst {
    Scram {
        version: ScramVersion,
        message: scram::ClientFirst,
        body: Document,
    },
}

impl ClientFirst {
    fn scram(version: ScramVersion, credential: &Credential) -> Result<Self> {
        let (message, body) = scram::build_speculative_client_first(version, credential)?;
        Ok(Self::Scram {
            version,
            message,
            body,
        })
    }

    /// The document embedded under `speculativeAuthenticate` in the
    /// handshake.
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram { body, .. } => body.clone(),
        }
    }

    /// Combines this message with the server's embedded response into the
    /// state needed to resume the exchange.
    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram {
                version, message, ..
            } => FirstRound::Scram(version, message, server_first),
        }
    }
}

/// The completed first round trip of a speculative authentication exchange.
#[derive(Clone, Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::ClientFirst, Document),
}

impl FirstRound {
    fn into_scram(self) -> Option<(scram::ClientFirst, Document)> {
        match self {
            FirstRound::Scram(_, client_first, server_first) => Some((client_first, server_first)),
        }
    }
}
