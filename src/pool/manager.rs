use tokio::sync::mpsc;

use crate::{
    conn::pooled::PooledConnection,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Handle for sending management requests (check-ins, invalidation, shutdown)
/// to the pool worker. Unlike a checkout requester, holding a manager does not
/// keep the worker alive.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Bumps the pool's generation, lazily invalidating all current
    /// connections.
    pub(super) fn clear(&self) {
        let _ = self.sender.send(PoolManagementRequest::Clear);
    }

    /// Returns a connection to the pool. On failure the connection is handed
    /// back to the caller, which happens when the pool has shut down.
    pub(crate) fn check_in(
        &self,
        connection: PooledConnection,
    ) -> std::result::Result<(), PooledConnection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            let PoolManagementRequest::CheckIn(conn) = request.0 else {
                unreachable!()
            };
            return Err(*conn);
        }
        Ok(())
    }

    pub(super) fn handle_connection_succeeded(&self, result: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(result));
    }

    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }

    /// Requests worker shutdown; the returned receiver resolves once the pool
    /// has quiesced and closed its connections.
    pub(super) fn shutdown(&self) -> AcknowledgmentReceiver<()> {
        let (message, receiver) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolManagementRequest::Shutdown(message));
        receiver
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Mark all current connections stale.
    Clear,

    /// Return a connection to the pool.
    CheckIn(Box<PooledConnection>),

    /// An establishment task finished successfully.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// An establishment task failed.
    HandleConnectionFailed,

    /// Stop the worker after quiescing.
    Shutdown(AcknowledgedMessage<()>),
}

/// What became of a successfully established connection.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// The connection was delivered to the checkout that requested it.
    Used,

    /// The connection was opened by maintenance to satisfy `min_size` and
    /// belongs in the idle queue.
    ForPool(Box<PooledConnection>),
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}
