mod command;
mod description;
pub(crate) mod pooled;
#[cfg(test)]
pub(crate) mod test;
pub(crate) mod wire;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Mutex as SyncMutex, RwLock,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{split, BufReader, BufWriter, ReadHalf, WriteHalf},
    sync::{oneshot, watch, Mutex},
};

pub use self::{
    command::{Command, CommandResponse},
    description::ConnectionDescription,
    pooled::PooledConnection,
};
use self::wire::{Message, MessageFlags};
use crate::{
    compression::Compressor,
    error::{Error, ErrorKind, Result, TimeoutPhase},
    event::pool::{ConnectionCreatedEvent, PoolEventEmitter},
    next_request_id,
    options::ServerAddress,
    runtime::AsyncStream,
};

/// User-facing information about a connection to the server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// The driver-generated identifier that uniquely identifies the connection
    /// within its pool.
    pub id: u32,

    /// The server-generated identifier for the connection, when the server
    /// reports one. Useful for correlating driver connections with server
    /// logs.
    pub server_id: Option<i64>,

    /// The address the connection is connected to.
    pub address: ServerAddress,
}

const STATE_UNOPENED: u8 = 0;
const STATE_OPENING: u8 = 1;
const STATE_OPENED: u8 = 2;
const STATE_CLOSED: u8 = 3;

struct SendHalf {
    writer: BufWriter<WriteHalf<AsyncStream>>,
    compressor: Option<Compressor>,
}

struct RecvHalf {
    reader: BufReader<ReadHalf<AsyncStream>>,
}

/// A single established (or establishing) connection to a server.
///
/// The connection is full duplex: any number of tasks may call
/// [`send_and_receive`](InternalConnection::send_and_receive) concurrently.
/// Sends are serialized by the send half's lock; one reader at a time holds
/// the receive half's lock and routes each decoded reply to the waiter
/// registered under its `response_to` id. Once a read, write, or deadline
/// failure occurs the connection is closed and every outstanding waiter fails.
pub struct InternalConnection {
    /// Driver-generated ID for the connection, unique within its pool.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool generation this connection was created in.
    pub(crate) generation: u32,

    pub(crate) time_created: Instant,

    state: AtomicU8,

    /// Populated during the handshake.
    description: RwLock<Option<ConnectionDescription>>,

    send_half: Mutex<SendHalf>,

    recv_half: Mutex<RecvHalf>,

    /// Waiters for in-flight requests, keyed by request id.
    pending_replies: SyncMutex<HashMap<i32, oneshot::Sender<Result<Message>>>>,

    /// Broadcasts `true` once the connection is closed; blocked reads and
    /// writes select on this so close interrupts them.
    shutdown: watch::Sender<bool>,

    /// The first error observed on the stream, if any.
    error: SyncMutex<Option<Error>>,

    /// Fallback deadline applied to exchanges that carry no operation
    /// deadline.
    read_timeout: SyncMutex<Option<Duration>>,

    /// Whether the most recent reply carried the more-to-come flag, meaning
    /// the server will send further replies unprompted.
    more_to_come: AtomicBool,
}

impl InternalConnection {
    pub(crate) fn new(pending: PendingConnection, stream: AsyncStream) -> Self {
        let (read_half, write_half) = split(stream);
        let (shutdown, _) = watch::channel(false);
        Self {
            id: pending.id,
            address: pending.address,
            generation: pending.generation,
            time_created: pending.time_created,
            state: AtomicU8::new(STATE_UNOPENED),
            description: RwLock::new(None),
            send_half: Mutex::new(SendHalf {
                writer: BufWriter::new(write_half),
                compressor: None,
            }),
            recv_half: Mutex::new(RecvHalf {
                reader: BufReader::new(read_half),
            }),
            pending_replies: SyncMutex::new(HashMap::new()),
            shutdown,
            error: SyncMutex::new(None),
            read_timeout: SyncMutex::new(None),
            more_to_come: AtomicBool::new(false),
        }
    }

    /// User-facing information about this connection.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self
                .description()
                .and_then(|d| d.server_connection_id),
            address: self.address.clone(),
        }
    }

    /// The address this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The `ConnectionDescription` captured during the handshake, or `None` if
    /// the connection has not finished opening.
    pub fn description(&self) -> Option<ConnectionDescription> {
        self.description.read().unwrap().clone()
    }

    /// Like [`description`](Self::description) but failing for connections
    /// handed out without a completed handshake, which indicates a bug.
    pub(crate) fn description_or_err(&self) -> Result<ConnectionDescription> {
        self.description().ok_or_else(|| {
            ErrorKind::Internal {
                message: "connection checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    /// Whether the server this connection talks to supports sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.description()
            .map(|d| d.supports_sessions())
            .unwrap_or(false)
    }

    pub(crate) fn mark_opening(&self) {
        let _ = self.state.compare_exchange(
            STATE_UNOPENED,
            STATE_OPENING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_opened(&self, description: ConnectionDescription) {
        *self.description.write().unwrap() = Some(description);
        let _ = self.state.compare_exchange(
            STATE_OPENING,
            STATE_OPENED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) async fn set_compressor(&self, compressor: Compressor) {
        self.send_half.lock().await.compressor = Some(compressor);
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock().unwrap() = timeout;
    }

    /// The caller's deadline, or one derived from the configured socket read
    /// timeout when the operation carries none.
    fn effective_deadline(&self, deadline: Option<Instant>) -> Option<Instant> {
        deadline.or_else(|| {
            self.read_timeout
                .lock()
                .unwrap()
                .map(|timeout| Instant::now() + timeout)
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Whether the server has announced further unprompted replies on this
    /// connection.
    pub(crate) fn is_streaming(&self) -> bool {
        self.more_to_come.load(Ordering::SeqCst)
    }

    /// Whether a network error has been observed on this connection.
    pub(crate) fn has_errored(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    /// Whether replies are still owed to callers. A connection checked in
    /// with outstanding requests was dropped mid-operation and cannot be
    /// reused.
    pub(crate) fn has_outstanding_requests(&self) -> bool {
        !self.pending_replies.lock().unwrap().is_empty()
    }

    fn closed_error(&self) -> Error {
        let source = self.error.lock().unwrap().clone();
        Error::stream_closed(format!("connection {} to {} closed", self.id, self.address))
            .with_source(source)
    }

    /// Closes the connection, interrupting any blocked reads and writes and
    /// failing every outstanding waiter. Idempotent.
    pub(crate) fn close_with_error(&self, error: Error) {
        {
            let mut stored = self.error.lock().unwrap();
            if stored.is_none() {
                *stored = Some(error);
            }
        }
        self.close();
    }

    /// Closes the connection without recording an error, e.g. when the pool
    /// retires it. Idempotent.
    pub(crate) fn close(&self) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if previous == STATE_CLOSED {
            return;
        }

        let _ = self.shutdown.send(true);

        let waiters: Vec<_> = {
            let mut pending = self.pending_replies.lock().unwrap();
            pending.drain().collect()
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(self.closed_error()));
        }
    }

    async fn closed_signal(&self) {
        let mut receiver = self.shutdown.subscribe();
        if *receiver.borrow() {
            return;
        }
        while receiver.changed().await.is_ok() {
            if *receiver.borrow() {
                return;
            }
        }
    }

    fn register_waiter(&self, request_id: i32) -> oneshot::Receiver<Result<Message>> {
        let (sender, receiver) = oneshot::channel();
        self.pending_replies
            .lock()
            .unwrap()
            .insert(request_id, sender);
        receiver
    }

    fn deregister_waiter(&self, request_id: i32) {
        self.pending_replies.lock().unwrap().remove(&request_id);
    }

    fn route_reply(&self, reply: Message) {
        let waiter = self
            .pending_replies
            .lock()
            .unwrap()
            .remove(&reply.response_to);
        if let Some(waiter) = waiter {
            // The waiter may have stopped listening (e.g. its own deadline
            // expired); the reply is discarded in that case.
            let _ = waiter.send(Ok(reply));
        }
    }

    /// Sends a command and returns its decoded reply.
    pub async fn send_command(
        &self,
        command: Command,
        deadline: Option<Instant>,
    ) -> Result<CommandResponse> {
        let compress = command.should_compress();
        let message = command.into_message(next_request_id());
        let reply = self.send_and_receive(message, deadline, compress).await?;
        CommandResponse::new(self.address.clone(), reply)
    }

    /// Sends a message and waits for the reply bearing its request id.
    /// Replies for other in-flight requests read along the way are routed to
    /// their waiting callers.
    pub(crate) async fn send_and_receive(
        &self,
        mut message: Message,
        deadline: Option<Instant>,
        compress: bool,
    ) -> Result<Message> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.is_streaming() {
            return Err(Error::internal(format!(
                "attempted to send a message to {} while a streamed reply is pending",
                self.address
            )));
        }

        let request_id = match message.request_id {
            Some(id) => id,
            None => {
                let id = next_request_id();
                message.request_id = Some(id);
                id
            }
        };

        let result = match self.effective_deadline(deadline) {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.send_and_receive_inner(message, request_id, compress))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let error = Error::timeout(
                            TimeoutPhase::Operation,
                            format!("operation deadline elapsed on connection {}", self.id),
                        );
                        // The deadline must interrupt whatever syscall the
                        // exchange is blocked in, so the whole connection goes
                        // down with it.
                        self.close_with_error(error.clone());
                        self.deregister_waiter(request_id);
                        Err(error)
                    }
                }
            }
            None => self.send_and_receive_inner(message, request_id, compress).await,
        };

        if let Ok(ref reply) = result {
            self.more_to_come.store(
                reply.flags.contains(MessageFlags::MORE_TO_COME),
                Ordering::SeqCst,
            );
        }

        result
    }

    async fn send_and_receive_inner(
        &self,
        message: Message,
        request_id: i32,
        compress: bool,
    ) -> Result<Message> {
        let receiver = self.register_waiter(request_id);

        if let Err(error) = self.send_message(&message, compress).await {
            self.close_with_error(error.clone());
            self.deregister_waiter(request_id);
            return Err(error);
        }

        self.receive_reply(request_id, receiver).await
    }

    async fn send_message(&self, message: &Message, compress: bool) -> Result<()> {
        let mut send = self.send_half.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let SendHalf {
            ref mut writer,
            ref compressor,
        } = *send;

        let write = async {
            match compressor {
                Some(compressor) if compress => {
                    message.write_compressed_to(writer, compressor).await
                }
                _ => message.write_to(writer).await,
            }
        };

        tokio::select! {
            biased;
            result = write => result.map(|_| ()),
            _ = self.closed_signal() => Err(self.closed_error()),
        }
    }

    async fn receive_reply(
        &self,
        request_id: i32,
        mut receiver: oneshot::Receiver<Result<Message>>,
    ) -> Result<Message> {
        loop {
            tokio::select! {
                biased;
                result = &mut receiver => {
                    return result.unwrap_or_else(|_| Err(self.closed_error()));
                }
                mut recv = self.recv_half.lock() => {
                    // Another reader may have routed our reply while we were
                    // waiting for the lock.
                    match receiver.try_recv() {
                        Ok(result) => return result,
                        Err(oneshot::error::TryRecvError::Empty) => {}
                        Err(oneshot::error::TryRecvError::Closed) => {
                            return Err(self.closed_error());
                        }
                    }
                    if self.is_closed() {
                        return Err(self.closed_error());
                    }

                    let max_message_size =
                        self.description().map(|d| d.max_message_size_bytes);
                    let read_result = {
                        let RecvHalf { ref mut reader } = *recv;
                        tokio::select! {
                            result = Message::read_from(reader, max_message_size) => result,
                            _ = self.closed_signal() => Err(self.closed_error()),
                        }
                    };
                    drop(recv);

                    match read_result {
                        Ok(reply) => {
                            if reply.response_to == request_id {
                                self.deregister_waiter(request_id);
                                return Ok(reply);
                            }
                            self.route_reply(reply);
                        }
                        Err(error) => {
                            self.close_with_error(error.clone());
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Reads the next unprompted reply from a connection whose last reply was
    /// flagged more-to-come.
    pub(crate) async fn receive_more(&self, deadline: Option<Instant>) -> Result<Message> {
        if !self.is_streaming() {
            return Err(Error::internal(format!(
                "attempted to stream a reply from {} but no streamed reply is pending",
                self.address
            )));
        }

        let read = async {
            let mut recv = self.recv_half.lock().await;
            let max_message_size = self.description().map(|d| d.max_message_size_bytes);
            let RecvHalf { ref mut reader } = *recv;
            tokio::select! {
                result = Message::read_from(reader, max_message_size) => result,
                _ = self.closed_signal() => Err(self.closed_error()),
            }
        };

        let result = match self.effective_deadline(deadline) {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        let error = Error::timeout(
                            TimeoutPhase::Read,
                            format!("read deadline elapsed on connection {}", self.id),
                        );
                        self.close_with_error(error.clone());
                        Err(error)
                    }
                }
            }
            None => read.await,
        };

        match result {
            Ok(reply) => {
                self.more_to_come.store(
                    reply.flags.contains(MessageFlags::MORE_TO_COME),
                    Ordering::SeqCst,
                );
                Ok(reply)
            }
            Err(error) => {
                self.close_with_error(error.clone());
                Err(error)
            }
        }
    }
}

impl Drop for InternalConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InternalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

/// The information needed to establish a connection.
///
/// Creating a `PendingConnection` counts toward the pool's total connection
/// count before any TCP connect happens, which is what bounds the number of
/// concurrent opens.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) event_emitter: PoolEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}
