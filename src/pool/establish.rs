use std::time::Duration;

use derive_where::derive_where;

use crate::{
    auth::Credential,
    conn::{pooled::PooledConnection, PendingConnection},
    error::{Result, TimeoutPhase},
    handshake::{Handshaker, HandshakerOptions},
    options::{ServerAddress, SocketOptions, TlsOptions},
    runtime::{self, stream::DEFAULT_CONNECT_TIMEOUT, AsyncStream, TlsConfig},
};

#[cfg(test)]
use futures_util::future::BoxFuture;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
pub(crate) type TestConnectionFactory =
    Arc<dyn Fn(PendingConnection) -> BoxFuture<'static, Result<PooledConnection>> + Send + Sync>;

/// Contains the logic to establish a connection: TCP (and TLS) bring-up under
/// the connect timeout, then handshake and authentication.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionEstablisher {
    #[derive_where(skip)]
    handshaker: Handshaker,

    /// Cached TLS configuration, present iff TLS is enabled.
    #[derive_where(skip)]
    tls_config: Option<TlsConfig>,

    socket_options: SocketOptions,

    connect_timeout: Duration,

    /// Replaces the entire establishment flow in pool tests.
    #[cfg(test)]
    #[derive_where(skip)]
    test_factory: Option<TestConnectionFactory>,
}

/// Options for creating a [`ConnectionEstablisher`].
#[derive(Clone, Debug, Default)]
pub struct EstablisherOptions {
    /// Options governing the handshake sent on each new connection.
    pub handshake_options: HandshakerOptions,

    /// TLS configuration; `None` disables TLS.
    pub tls_options: Option<TlsOptions>,

    /// Socket tuning applied to every connection.
    pub socket_options: SocketOptions,
}

impl ConnectionEstablisher {
    /// Creates a new establisher from the given options.
    pub(crate) fn new(options: EstablisherOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options.handshake_options)?;

        let tls_config = match options.tls_options {
            Some(tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        let connect_timeout = match options.socket_options.connect_timeout {
            Some(timeout) if timeout.is_zero() => Duration::MAX,
            Some(timeout) => timeout,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Ok(Self {
            handshaker,
            tls_config,
            socket_options: options.socket_options,
            connect_timeout,
            #[cfg(test)]
            test_factory: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(factory: TestConnectionFactory) -> Self {
        Self {
            handshaker: Handshaker::new(HandshakerOptions::default())
                .expect("default handshake options are valid"),
            tls_config: None,
            socket_options: SocketOptions::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            test_factory: Some(factory),
        }
    }

    async fn make_stream(&self, address: &ServerAddress) -> Result<AsyncStream> {
        runtime::timeout(
            self.connect_timeout,
            TimeoutPhase::Connect,
            AsyncStream::connect(address, self.tls_config.as_ref(), &self.socket_options),
        )
        .await?
    }

    /// Establishes a connection: connect, handshake, authenticate. On any
    /// failure the underlying stream is closed and the error is surfaced to
    /// the caller; a timed-out connect drops its socket rather than leaking
    /// it.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
        credential: Option<&Credential>,
    ) -> Result<PooledConnection> {
        #[cfg(test)]
        if let Some(ref factory) = self.test_factory {
            return factory(pending_connection).await;
        }

        let address = pending_connection.address.clone();
        let stream = self.make_stream(&address).await?;

        let connection = PooledConnection::new(pending_connection, stream);
        connection.set_read_timeout(self.socket_options.read_timeout);
        connection.mark_opening();

        if let Err(error) = self.handshaker.handshake(&connection, credential).await {
            // The worker's establishment path emits the closed event; here the
            // stream just needs to go down.
            connection.close();
            return Err(error);
        }

        Ok(connection)
    }
}
