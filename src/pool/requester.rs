use tokio::sync::{mpsc, oneshot};

use crate::{
    conn::pooled::PooledConnection,
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver { receiver },
    )
}

/// Handle for requesting connections from the pool worker. Requesters keep the
/// worker alive: once every requester is dropped the worker drains its
/// connections and exits.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<oneshot::Sender<ConnectionRequestResult>>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    /// Requests a connection. Returns `None` if the worker has already shut
    /// down (explicit close).
    pub(super) async fn request(&self) -> Option<ConnectionRequestResult> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(sender).ok()?;
        receiver.await.ok()
    }
}

#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<ConnectionRequestResult>>,
}

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver
            .recv()
            .await
            .map(|sender| ConnectionRequest { sender })
    }
}

/// A parked checkout waiting in the pool's FIFO wait queue.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Fulfills the request. Fails (returning the result) when the requester
    /// stopped listening, e.g. because its wait deadline expired.
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result)
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// A warm connection checked out of the idle queue or handed over by a
    /// check-in.
    Pooled(Box<PooledConnection>),

    /// A connection being established for this request; await the handle to
    /// receive it.
    Establishing(AsyncJoinHandle<Result<PooledConnection>>),

    /// The pool shut down before the request could be fulfilled.
    Closed(Error),
}

impl ConnectionRequestResult {
    pub(super) fn unwrap_pooled_connection(self) -> PooledConnection {
        match self {
            ConnectionRequestResult::Pooled(conn) => *conn,
            _ => panic!("attempted to unwrap a non-pooled connection request result"),
        }
    }
}
