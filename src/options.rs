//! Configuration types consumed by the pool, stream, and session layers.

use std::{
    fmt::{self, Display},
    time::Duration,
};

use bson::{doc, Document, Timestamp};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};

/// The default port to connect to when none is specified.
pub const DEFAULT_PORT: u16 = 27017;

/// The network address of a server. Equality and hashing are over the textual
/// `host:port` pair; resolution to socket addresses happens at connect time.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    /// The hostname or IP literal.
    pub host: String,

    /// The port. `None` is equivalent to [`DEFAULT_PORT`].
    pub port: Option<u16>,
}

impl ServerAddress {
    /// Constructs an address from a host and an explicit port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Parses an address from a `host[:port]` string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part.to_string(),
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => Some(part.parse::<u16>().map_err(|_| {
                ErrorKind::InvalidArgument {
                    message: format!("port must be valid 16-bit unsigned integer, got {}", part),
                }
            })?),
            None => None,
        };

        if parts.next().is_some() {
            return Err(ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{}\"", address),
            }
            .into());
        }

        Ok(Self { host, port })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port())
    }
}

/// Socket-level configuration applied to every connection.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SocketOptions {
    /// The amount of time to allow a TCP connect (and TLS handshake) to take
    /// before erroring out. Defaults to 10 seconds; a zero duration disables
    /// the timeout.
    pub connect_timeout: Option<Duration>,

    /// A default deadline applied to reads that carry no operation deadline.
    pub read_timeout: Option<Duration>,

    /// Size of the kernel receive buffer, when overridden.
    pub receive_buffer_size: Option<u32>,

    /// Size of the kernel send buffer, when overridden.
    pub send_buffer_size: Option<u32>,

    /// Idle time before the first keep-alive probe is sent.
    pub keep_alive_time: Option<Duration>,
}

/// TLS configuration for connections.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether hostname verification should be skipped. Defaults to false; only
    /// enable for testing against servers with mismatched certificates.
    pub allow_invalid_hostnames: Option<bool>,

    /// Additional DER-encoded root certificates to trust beyond the bundled
    /// webpki roots.
    pub extra_root_certificates: Option<Vec<Vec<u8>>>,

    /// Overrides the server name sent for SNI and used for hostname
    /// verification. Defaults to the connected host.
    pub sni_host: Option<String>,
}

/// A declared server API version, attached to every command.
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerApi {
    /// The API version to declare.
    #[builder(setter(into))]
    pub version: ServerApiVersion,

    /// Whether the server should reject commands outside the declared version.
    #[builder(default)]
    pub strict: Option<bool>,

    /// Whether the server should error on deprecated features of the declared
    /// version.
    #[builder(default)]
    pub deprecation_errors: Option<bool>,
}

/// The declarable server API versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Version 1 of the server API.
    #[serde(rename = "1")]
    V1,
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("1"),
        }
    }
}

/// Information about a library wrapping this driver, appended to the client
/// metadata after construction.
#[derive(Clone, Debug, TypedBuilder, PartialEq)]
#[non_exhaustive]
pub struct DriverInfo {
    /// The name of the wrapping library.
    #[builder(setter(into))]
    pub name: String,

    /// The version of the wrapping library.
    #[builder(default, setter(into, strip_option))]
    pub version: Option<String>,

    /// Platform information for the wrapping library.
    #[builder(default, setter(into, strip_option))]
    pub platform: Option<String>,
}

/// The level of isolation a read should observe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// Reads return the most recent data available on the queried node.
    Local,
    /// Reads return data acknowledged by a majority of the replica set.
    Majority,
    /// Reads return majority-committed data from a single point in time.
    Snapshot,
    /// Reads reflect all prior writes made with "majority" write concern.
    Linearizable,
    /// Reads return data available on the queried node with no guarantee that
    /// it has been written to a majority.
    Available,
}

impl ReadConcernLevel {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
        }
    }
}

/// The read concern attached to a command.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The isolation level, when one is asserted.
    pub level: Option<ReadConcernLevel>,

    /// For snapshot reads, the timestamp to read at.
    pub at_cluster_time: Option<Timestamp>,

    /// For causally consistent reads, the operation time the read must observe.
    pub after_cluster_time: Option<Timestamp>,
}

impl ReadConcern {
    /// A read concern at the given level with no timestamps.
    pub fn new(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            at_cluster_time: None,
            after_cluster_time: None,
        }
    }

    /// A majority read concern.
    pub fn majority() -> Self {
        Self::new(ReadConcernLevel::Majority)
    }

    /// A snapshot read concern.
    pub fn snapshot() -> Self {
        Self::new(ReadConcernLevel::Snapshot)
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! {};
        if let Some(ref level) = self.level {
            doc.insert("level", level.as_str());
        }
        if let Some(at) = self.at_cluster_time {
            doc.insert("atClusterTime", at);
        }
        if let Some(after) = self.after_cluster_time {
            doc.insert("afterClusterTime", after);
        }
        doc
    }
}

/// The write acknowledgement requested for a command.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteConcern {
    /// The number of nodes (or "majority") that must acknowledge the write.
    pub w: Option<Acknowledgment>,

    /// Whether the write must be written to the on-disk journal before being
    /// acknowledged.
    #[serde(rename = "j")]
    pub journal: Option<bool>,

    /// How long the server should wait for the requested acknowledgement.
    #[serde(
        rename = "wtimeout",
        serialize_with = "serialize_duration_as_millis",
        skip_serializing_if = "Option::is_none",
        default,
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub w_timeout: Option<Duration>,
}

fn serialize_duration_as_millis<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_i64(d.as_millis() as i64),
        None => s.serialize_none(),
    }
}

fn deserialize_duration_from_millis<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let millis: Option<u64> = Option::deserialize(d)?;
    Ok(millis.map(Duration::from_millis))
}

/// The write acknowledgement level.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Acknowledged by the given number of nodes.
    Nodes(i32),
    /// Acknowledged by a majority of the replica set.
    Majority,
    /// Acknowledged by nodes with the given custom write concern tag.
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Nodes(n) => s.serialize_i32(*n),
            Acknowledgment::Majority => s.serialize_str("majority"),
            Acknowledgment::Custom(tag) => s.serialize_str(tag),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: serde::Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Acknowledgment, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Nodes(i32),
            Tag(String),
        }
        Ok(match Helper::deserialize(d)? {
            Helper::Nodes(n) => Acknowledgment::Nodes(n),
            Helper::Tag(tag) if tag == "majority" => Acknowledgment::Majority,
            Helper::Tag(tag) => Acknowledgment::Custom(tag),
        })
    }
}

impl WriteConcern {
    /// Whether this write concern requests any acknowledgement at all.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }
}

/// Options for creating a [`ClientSession`](crate::session::ClientSession).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether operations on the session observe causal consistency. Defaults
    /// to true unless the session is a snapshot session.
    pub causal_consistency: Option<bool>,

    /// Whether reads on the session observe a single majority-committed
    /// snapshot. Incompatible with causal consistency and transactions.
    pub snapshot: Option<bool>,

    /// Default options applied to transactions started on the session.
    pub default_transaction_options: Option<TransactionOptions>,
}

impl SessionOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.causal_consistency == Some(true) && self.snapshot == Some(true) {
            return Err(ErrorKind::InvalidArgument {
                message: "a session cannot be both causally consistent and a snapshot session"
                    .to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Options applied to a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern for reads within the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern for the transaction commit.
    pub write_concern: Option<WriteConcern>,

    /// How long the server should allow the commit to run.
    pub max_commit_time: Option<Duration>,
}
