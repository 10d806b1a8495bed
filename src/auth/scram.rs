//! SCRAM-SHA-1 and SCRAM-SHA-256 over the SASL exchange.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bson::Document;
use hmac::{digest::InvalidLength, Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use super::{
    sasl::{SaslContinue, SaslResponse, SaslStart},
    AuthMechanism, Credential,
};
use crate::{
    conn::InternalConnection,
    error::{Error, Result},
};

/// The server must report at least this many PBKDF2 rounds; anything lower is
/// treated as a downgrade attempt.
const MIN_ITERATION_COUNT: u32 = 4096;

const NO_CHANNEL_BINDING: &str = "biws";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    fn mechanism(&self) -> AuthMechanism {
        match self {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    fn mechanism_name(&self) -> &'static str {
        self.mechanism().as_str()
    }

    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        let error = || Error::unknown_authentication_error(self.mechanism_name());
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input).map_err(|_| error()),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input).map_err(|_| error()),
        }
    }

    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        let error = || Error::invalid_authentication_response(self.mechanism_name());
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
        .map_err(|_| error())
    }

    fn h(&self, val: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => Sha1::digest(val).to_vec(),
            ScramVersion::Sha256 => Sha256::digest(val).to_vec(),
        }
    }

    /// Computes the PBKDF2 salted password. SHA-1 salts the legacy MD5 digest
    /// of `user:mongo:password`; SHA-256 salts the SASLprep'd password.
    fn salted_password(
        &self,
        username: &str,
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => {
                let digest = Md5::digest(format!("{}:mongo:{}", username, password).as_bytes());
                let hashed_password = hex::encode(digest);
                let mut salted = vec![0u8; 20];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(
                    hashed_password.as_bytes(),
                    salt,
                    iterations,
                    &mut salted,
                )
                .map_err(|_| Error::unknown_authentication_error(self.mechanism_name()))?;
                Ok(salted)
            }
            ScramVersion::Sha256 => {
                let prepped = stringprep::saslprep(password).map_err(|_| {
                    Error::authentication_error(
                        self.mechanism_name(),
                        "password contains prohibited characters",
                    )
                })?;
                let mut salted = vec![0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(prepped.as_bytes(), salt, iterations, &mut salted)
                    .map_err(|_| Error::unknown_authentication_error(self.mechanism_name()))?;
                Ok(salted)
            }
        }
    }
}

impl fmt::Display for ScramVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

fn mac<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    input: &[u8],
) -> std::result::Result<Vec<u8>, InvalidLength> {
    let mut mac = <M as Mac>::new_from_slice(key)?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    input: &[u8],
    signature: &[u8],
) -> std::result::Result<(), InvalidLength> {
    let mut mac = <M as Mac>::new_from_slice(key)?;
    mac.update(input);
    mac.verify_slice(signature).map_err(|_| InvalidLength)
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());
    lhs.iter().zip(rhs.iter()).map(|(l, r)| l ^ r).collect()
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// RFC 5802 username escaping.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// The client-first SCRAM message, kept around because the final proof signs
/// the whole conversation.
#[derive(Clone, Debug)]
pub(crate) struct ClientFirst {
    bare: String,
    nonce: String,
}

impl ClientFirst {
    fn new(username: &str) -> Self {
        let nonce = generate_nonce();
        Self {
            bare: format!("n={},r={}", escape_username(username), nonce),
            nonce,
        }
    }

    fn bare(&self) -> &str {
        &self.bare
    }

    fn nonce(&self) -> &str {
        &self.nonce
    }

    fn payload(&self) -> Vec<u8> {
        format!("n,,{}", self.bare).into_bytes()
    }
}

/// Builds the client-first message for speculative authentication in the
/// handshake.
pub(crate) fn build_speculative_client_first(
    version: ScramVersion,
    credential: &Credential,
) -> Result<(ClientFirst, Document)> {
    let username = credential
        .username
        .as_deref()
        .ok_or_else(|| Error::authentication_error(version.mechanism_name(), "no username supplied"))?;

    let client_first = ClientFirst::new(username);
    let mut body = SaslStart::new(
        credential.resolved_source().to_string(),
        version.mechanism(),
        client_first.payload(),
    )
    .body();
    body.insert("db", credential.resolved_source());

    Ok((client_first, body))
}

struct ServerFirst {
    message: String,
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(version: ScramVersion, payload: &[u8]) -> Result<Self> {
        let message = std::str::from_utf8(payload)
            .map_err(|_| Error::invalid_authentication_response(version.mechanism_name()))?
            .to_string();

        let nonce = parse_kvp(&message, version, 'r')?;
        let salt = BASE64
            .decode(parse_kvp(&message, version, 's')?)
            .map_err(|_| Error::invalid_authentication_response(version.mechanism_name()))?;
        let iterations = parse_kvp(&message, version, 'i')?
            .parse::<u32>()
            .map_err(|_| Error::invalid_authentication_response(version.mechanism_name()))?;

        Ok(Self {
            message,
            nonce,
            salt,
            iterations,
        })
    }

    fn validate(&self, version: ScramVersion, client_nonce: &str) -> Result<()> {
        if !self.nonce.starts_with(client_nonce) {
            return Err(Error::authentication_error(
                version.mechanism_name(),
                "server did not echo the client nonce",
            ));
        }
        if self.iterations < MIN_ITERATION_COUNT {
            return Err(Error::authentication_error(
                version.mechanism_name(),
                "server reported an iteration count below the minimum",
            ));
        }
        Ok(())
    }
}

fn parse_kvp(message: &str, version: ScramVersion, key: char) -> Result<String> {
    message
        .split(',')
        .find_map(|kvp| {
            let mut chars = kvp.chars();
            if chars.next() == Some(key) && chars.next() == Some('=') {
                Some(kvp[2..].to_string())
            } else {
                None
            }
        })
        .ok_or_else(|| Error::invalid_authentication_response(version.mechanism_name()))
}

/// Runs the SCRAM conversation on a connection. When speculative
/// authentication already performed the first round trip inside the
/// handshake, its client-first message and the server's embedded response are
/// passed in and the conversation resumes at the proof exchange.
pub(crate) async fn authenticate_stream(
    conn: &InternalConnection,
    credential: &Credential,
    version: ScramVersion,
    first_round: Option<(ClientFirst, Document)>,
) -> Result<()> {
    let mechanism_name = version.mechanism_name();
    let username = credential
        .username
        .as_deref()
        .ok_or_else(|| Error::authentication_error(mechanism_name, "no username supplied"))?;
    let password = credential
        .password
        .as_deref()
        .ok_or_else(|| Error::authentication_error(mechanism_name, "no password supplied"))?;
    let source = credential.resolved_source().to_string();

    let (client_first, server_response) = match first_round {
        Some((client_first, server_first_body)) => (
            client_first,
            SaslResponse::parse(mechanism_name, server_first_body)?,
        ),
        None => {
            let client_first = ClientFirst::new(username);
            let command = SaslStart::new(
                source.clone(),
                version.mechanism(),
                client_first.payload(),
            )
            .into_command();
            let response = conn.send_command(command, None).await?;
            (
                client_first,
                SaslResponse::parse(mechanism_name, response.raw_body().clone())?,
            )
        }
    };

    let server_first = ServerFirst::parse(version, &server_response.payload)?;
    server_first.validate(version, client_first.nonce())?;

    let salted_password =
        version.salted_password(username, password, &server_first.salt, server_first.iterations)?;

    let client_key = version.hmac(&salted_password, b"Client Key")?;
    let stored_key = version.h(&client_key);

    let without_proof = format!("c={},r={}", NO_CHANNEL_BINDING, server_first.nonce);
    let auth_message = format!(
        "{},{},{}",
        client_first.bare(),
        server_first.message,
        without_proof
    );

    let client_signature = version.hmac(&stored_key, auth_message.as_bytes())?;
    let client_proof = BASE64.encode(xor(&client_key, &client_signature));
    let client_final = format!("{},p={}", without_proof, client_proof);

    let command = SaslContinue::new(
        source.clone(),
        server_response.conversation_id.clone(),
        client_final.into_bytes(),
    )
    .into_command();
    let response = conn.send_command(command, None).await?;
    let continue_response = SaslResponse::parse(mechanism_name, response.raw_body().clone())?;

    let server_final = std::str::from_utf8(&continue_response.payload)
        .map_err(|_| Error::invalid_authentication_response(mechanism_name))?;
    if let Some(error) = server_final.strip_prefix("e=") {
        return Err(Error::authentication_error(mechanism_name, error));
    }
    let server_signature = server_final
        .strip_prefix("v=")
        .and_then(|v| BASE64.decode(v).ok())
        .ok_or_else(|| Error::invalid_authentication_response(mechanism_name))?;

    let server_key = version.hmac(&salted_password, b"Server Key")?;
    version.hmac_verify(&server_key, auth_message.as_bytes(), &server_signature)?;

    if !continue_response.done {
        // The server ignored skipEmptyExchange; one empty round completes the
        // conversation.
        let command = SaslContinue::new(
            source,
            continue_response.conversation_id.clone(),
            Vec::new(),
        )
        .into_command();
        let response = conn.send_command(command, None).await?;
        let final_response = SaslResponse::parse(mechanism_name, response.raw_body().clone())?;
        if !final_response.done {
            return Err(Error::authentication_error(
                mechanism_name,
                "exchange did not complete",
            ));
        }
    }

    Ok(())
}

/// Picks the SCRAM version to use based on the mechanisms advertised in the
/// handshake. Prefers SHA-256 when the user supports it.
pub(crate) fn version_from_advertised(mechanisms: Option<&Vec<String>>) -> ScramVersion {
    let sha256_supported = mechanisms
        .map(|mechs| mechs.iter().any(|m| m == AuthMechanism::ScramSha256.as_str()))
        .unwrap_or(false);
    if sha256_supported {
        ScramVersion::Sha256
    } else {
        ScramVersion::Sha1
    }
}
