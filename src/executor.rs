//! Dispatches single commands over pooled connections: session and
//! cluster-time enrichment on the way out, gossip merging and error
//! classification on the way back, with monitoring events around both.

use std::{sync::Arc, time::Instant};

use bson::Document;

use crate::{
    conn::{pooled::PooledConnection, Command, CommandResponse},
    error::{ErrorKind, Result},
    event::command::{
        CommandEvent, CommandEventEmitter, CommandEventHandler, CommandFailedEvent,
        CommandStartedEvent, CommandSucceededEvent,
    },
    next_request_id,
    operation::OperationContext,
    session::{
        ExplicitSessionContext, ImplicitSessionContext, SessionContext, TransactionState,
    },
    ClusterClock,
};

/// Executes commands on connections, owning the pieces shared across
/// operations: the cluster clock and the command-monitoring emitter.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    clock: ClusterClock,

    event_emitter: CommandEventEmitter,
}

impl CommandExecutor {
    /// Creates an executor gossiping into `clock` and reporting to `handler`.
    pub fn new(clock: ClusterClock, handler: Option<Arc<dyn CommandEventHandler>>) -> Self {
        Self {
            clock,
            event_emitter: CommandEventEmitter::new(handler),
        }
    }

    /// The clock this executor merges reply cluster times into.
    pub fn clock(&self) -> &ClusterClock {
        &self.clock
    }

    /// Dispatches one command on the given connection.
    ///
    /// The outgoing command is enriched with the context's session identity,
    /// transaction fields, gossip, and read concern. The reply's cluster time
    /// and operation time are merged back; network failures mark the session
    /// dirty. A monitoring event for the outcome is always emitted before
    /// this returns.
    pub async fn execute(
        &self,
        mut cmd: Command,
        connection: &PooledConnection,
        ctx: &mut OperationContext<'_>,
    ) -> Result<CommandResponse> {
        if let Some(session) = ctx.session.as_deref_mut() {
            if !connection.supports_sessions() && session.id().is_some() {
                return Err(ErrorKind::SessionsNotSupported.into());
            }

            let transaction_starting =
                session.transaction_state() == TransactionState::Starting;
            if session.is_implicit() {
                let mut session_ctx = ImplicitSessionContext::new(session);
                enrich_command(&mut cmd, &mut session_ctx, transaction_starting)?;
            } else {
                let mut session_ctx = ExplicitSessionContext::new(session);
                enrich_command(&mut cmd, &mut session_ctx, transaction_starting)?;
            }
        }

        // Gossip the highest cluster time seen by the session or the process.
        let session_cluster_time = ctx.session.as_deref().and_then(|s| s.cluster_time().cloned());
        let clock_cluster_time = self.clock.current();
        let max_cluster_time = match (session_cluster_time, clock_cluster_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(ref cluster_time) = max_cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        if let Some(server_api) = ctx.server_api() {
            cmd.set_server_api(server_api);
        }

        let request_id = next_request_id();
        let operation_id = ctx.operation_id();
        let should_redact = cmd.should_redact();
        let should_compress = cmd.should_compress();
        let command_name = cmd.name().to_string();
        let target_db = cmd.target_db().to_string();
        let connection_info = connection.info();

        let message = cmd.into_message(request_id);

        self.event_emitter.emit_event(|| {
            let command_body = if should_redact {
                Document::new()
            } else {
                message.document_payload().cloned().unwrap_or_default()
            };
            CommandEvent::Started(CommandStartedEvent {
                command: command_body,
                db: target_db.clone(),
                command_name: command_name.clone(),
                request_id,
                operation_id,
                connection: connection_info.clone(),
            })
        });

        let start_time = Instant::now();
        let wire_result = connection
            .send_and_receive(message, ctx.deadline(), should_compress)
            .await
            .and_then(|reply| CommandResponse::new(connection.address().clone(), reply));
        let command_result = match wire_result {
            Ok(response) => self.handle_response(response, ctx),
            Err(error) => Err(error),
        };
        let duration = start_time.elapsed();

        match command_result {
            Err(error) => {
                self.event_emitter.emit_event(|| {
                    let mut failure = error.clone();
                    if should_redact {
                        failure.redact();
                    }
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure,
                        request_id,
                        operation_id,
                        connection: connection_info.clone(),
                    })
                });

                if error.is_network_error() {
                    if let Some(session) = ctx.session.as_deref_mut() {
                        session.mark_dirty();
                    }
                }

                Err(error)
            }
            Ok(response) => {
                self.event_emitter.emit_event(|| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.raw_body().clone()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: command_name.clone(),
                        request_id,
                        operation_id,
                        connection: connection_info.clone(),
                    })
                });

                Ok(response)
            }
        }
    }

    /// Merges gossip out of a decoded reply and classifies `ok: 0` replies as
    /// command failures.
    fn handle_response(
        &self,
        response: CommandResponse,
        ctx: &mut OperationContext<'_>,
    ) -> Result<CommandResponse> {
        let ok = response.ok().ok_or_else(|| {
            crate::error::Error::from(ErrorKind::InvalidResponse {
                message: "missing 'ok' value in server reply".to_string(),
            })
        })?;

        if let Some(cluster_time) = response.cluster_time() {
            self.clock.advance(&cluster_time);
        }

        if let Some(session) = ctx.session.as_deref_mut() {
            let is_implicit = session.is_implicit();

            let snapshot_time = if session.is_snapshot()
                && session.snapshot_timestamp().is_none()
            {
                response.at_cluster_time()
            } else {
                None
            };
            if let Some(at_cluster_time) = snapshot_time {
                session.set_snapshot_timestamp(at_cluster_time)?;
            }

            let mut update = |session_ctx: &mut dyn SessionContext| {
                if let Some(cluster_time) = response.cluster_time() {
                    session_ctx.advance_cluster_time(&cluster_time);
                }
                if let Some(operation_time) = response.operation_time() {
                    session_ctx.advance_operation_time(operation_time);
                }
                session_ctx.notify_message_sent();
                if ok == 1 && session_ctx.has_active_transaction() {
                    if let Some(token) = response.recovery_token() {
                        session_ctx.set_recovery_token(token.clone());
                    }
                }
            };
            if is_implicit {
                update(&mut ImplicitSessionContext::new(session));
            } else {
                update(&mut ExplicitSessionContext::new(session));
            }
        }

        if ok == 1 {
            Ok(response)
        } else {
            Err(response.into_command_failure())
        }
    }
}

/// Attaches the session-derived fields to an outgoing command.
fn enrich_command(
    cmd: &mut Command,
    session_ctx: &mut impl SessionContext,
    transaction_starting: bool,
) -> Result<()> {
    if !session_ctx.has_session() {
        return Ok(());
    }

    if let Some(lsid) = session_ctx.session_id() {
        let lsid = lsid.clone();
        cmd.set_session_id(&lsid);
    }

    if session_ctx.has_active_transaction() {
        if let Some(txn_number) = session_ctx.txn_number() {
            cmd.set_txn_number(txn_number);
        }
        if transaction_starting {
            cmd.set_start_transaction();
        }
        cmd.set_autocommit();

        if cmd.name() == "commitTransaction" {
            if let Some(token) = session_ctx.recovery_token().cloned() {
                cmd.set_recovery_token(&token);
            }
        }
    }

    if !cmd.body.contains_key("readConcern") {
        if let Some(read_concern) = session_ctx.read_concern() {
            // A transaction's read concern goes out only on its first
            // command.
            let in_transaction = session_ctx.has_active_transaction();
            if !in_transaction || transaction_starting {
                cmd.set_read_concern(&read_concern);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bson::{doc, Bson, Document, Timestamp};

    use super::*;
    use crate::{
        conn::{
            test::{reply_message, request_body, scripted_connection},
            wire::Message,
            Command,
        },
        error::ErrorKind,
        session::{ClientSession, ServerSessionPool},
    };

    #[derive(Default)]
    struct EventCapture {
        started: Mutex<Vec<CommandStartedEvent>>,
        succeeded: Mutex<Vec<CommandSucceededEvent>>,
        failed: Mutex<Vec<CommandFailedEvent>>,
    }

    impl CommandEventHandler for EventCapture {
        fn handle_command_started_event(&self, event: CommandStartedEvent) {
            self.started.lock().unwrap().push(event);
        }

        fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
            self.succeeded.lock().unwrap().push(event);
        }

        fn handle_command_failed_event(&self, event: CommandFailedEvent) {
            self.failed.lock().unwrap().push(event);
        }
    }

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    fn cluster_time_doc(time: u32) -> Document {
        doc! {
            "clusterTime": Bson::Timestamp(ts(time, 0)),
            "signature": { "hash": Bson::Null, "keyId": 0_i64 },
        }
    }

    /// Runs one command against a scripted server that sends `reply`, and
    /// returns the executor result along with the request document the server
    /// saw.
    async fn exchange(
        executor: &CommandExecutor,
        cmd: Command,
        reply: Document,
        session: Option<&mut ClientSession>,
    ) -> (Result<CommandResponse>, Document) {
        let (conn, mut server_end) = scripted_connection();

        let server = tokio::spawn(async move {
            let request = Message::read_from(&mut server_end, None).await.unwrap();
            let body = request_body(&request).clone();
            reply_message(request.request_id.unwrap(), reply)
                .write_to(&mut server_end)
                .await
                .unwrap();
            body
        });

        let mut ctx = OperationContext::new(executor.clock().clone());
        if let Some(session) = session {
            ctx = ctx.with_session(session);
        }

        let result = executor.execute(cmd, &conn, &mut ctx).await;
        let request = server.await.unwrap();
        (result, request)
    }

    async fn session() -> ClientSession {
        let pool = Arc::new(ServerSessionPool::new());
        pool.update_logical_session_timeout(Some(Duration::from_secs(30 * 60)));
        ClientSession::start(pool, None, false).await.unwrap()
    }

    #[tokio::test]
    async fn sensitive_commands_are_redacted_in_events() {
        let capture = Arc::new(EventCapture::default());
        let executor = CommandExecutor::new(ClusterClock::new(), Some(capture.clone()));

        let cmd = Command::new(
            "saslContinue",
            "admin",
            doc! { "saslContinue": 1, "conversationId": 1, "payload": "secret" },
        );
        let (result, _) = exchange(
            &executor,
            cmd,
            doc! { "ok": 1, "conversationId": 1, "done": true, "payload": "" },
            None,
        )
        .await;
        result.unwrap();

        let started = capture.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert!(started[0].command.is_empty());
        let succeeded = capture.succeeded.lock().unwrap();
        assert_eq!(succeeded.len(), 1);
        assert!(succeeded[0].reply.is_empty());
    }

    #[tokio::test]
    async fn non_sensitive_commands_emit_full_documents() {
        let capture = Arc::new(EventCapture::default());
        let executor = CommandExecutor::new(ClusterClock::new(), Some(capture.clone()));

        let cmd = Command::new("find", "db", doc! { "find": "coll", "filter": { "x": 1 } });
        let (result, _) = exchange(&executor, cmd, doc! { "ok": 1, "cursor": {} }, None).await;
        result.unwrap();

        let started = capture.started.lock().unwrap();
        assert_eq!(started[0].command.get_str("find").unwrap(), "coll");
        assert_eq!(started[0].db, "db");
        let succeeded = capture.succeeded.lock().unwrap();
        assert!(succeeded[0].reply.contains_key("cursor"));
        assert_eq!(started[0].request_id, succeeded[0].request_id);
    }

    #[tokio::test]
    async fn reply_gossip_advances_the_clock_and_session() {
        let executor = CommandExecutor::new(ClusterClock::new(), None);
        let mut session = session().await;

        let reply = doc! {
            "ok": 1,
            "$clusterTime": cluster_time_doc(100),
            "operationTime": Bson::Timestamp(ts(100, 0)),
        };
        let (result, _) = exchange(
            &executor,
            Command::new("ping", "admin", doc! { "ping": 1 }),
            reply,
            Some(&mut session),
        )
        .await;
        result.unwrap();

        assert_eq!(
            executor.clock().current().unwrap().timestamp(),
            ts(100, 0)
        );
        assert_eq!(session.operation_time(), Some(ts(100, 0)));
        assert_eq!(session.cluster_time().unwrap().timestamp(), ts(100, 0));

        // An older gossip value leaves both untouched.
        let stale_reply = doc! {
            "ok": 1,
            "$clusterTime": cluster_time_doc(50),
            "operationTime": Bson::Timestamp(ts(50, 0)),
        };
        let (result, _) = exchange(
            &executor,
            Command::new("ping", "admin", doc! { "ping": 1 }),
            stale_reply,
            Some(&mut session),
        )
        .await;
        result.unwrap();

        assert_eq!(
            executor.clock().current().unwrap().timestamp(),
            ts(100, 0)
        );
        assert_eq!(session.operation_time(), Some(ts(100, 0)));
    }

    #[tokio::test]
    async fn session_fields_are_attached_to_commands() {
        let executor = CommandExecutor::new(ClusterClock::new(), None);
        let mut session = session().await;
        session.advance_operation_time(ts(5, 0));
        let lsid = session.id().unwrap().clone();

        let (result, request) = exchange(
            &executor,
            Command::new("find", "db", doc! { "find": "coll" }),
            doc! { "ok": 1 },
            Some(&mut session),
        )
        .await;
        result.unwrap();

        assert_eq!(request.get_document("lsid").unwrap(), &lsid);
        let read_concern = request.get_document("readConcern").unwrap();
        assert_eq!(
            read_concern.get("afterClusterTime"),
            Some(&Bson::Timestamp(ts(5, 0)))
        );
    }

    #[tokio::test]
    async fn the_known_cluster_time_is_gossipped_on_commands() {
        let executor = CommandExecutor::new(ClusterClock::new(), None);
        executor
            .clock()
            .advance(&crate::ClusterTime::new_testing(42, 0));

        let (result, request) = exchange(
            &executor,
            Command::new("ping", "admin", doc! { "ping": 1 }),
            doc! { "ok": 1 },
            None,
        )
        .await;
        result.unwrap();

        let gossip = request.get_document("$clusterTime").unwrap();
        assert_eq!(
            gossip.get("clusterTime"),
            Some(&Bson::Timestamp(ts(42, 0)))
        );
    }

    #[tokio::test]
    async fn transaction_fields_and_recovery_token_round_trip() {
        let executor = CommandExecutor::new(ClusterClock::new(), None);
        let mut session = session().await;
        session.start_transaction(None).unwrap();
        let txn_number = session.txn_number().unwrap();

        let (result, request) = exchange(
            &executor,
            Command::new("insert", "db", doc! { "insert": "coll" }),
            doc! { "ok": 1, "recoveryToken": { "shard": "rs0" } },
            Some(&mut session),
        )
        .await;
        result.unwrap();

        assert_eq!(request.get_i64("txnNumber").unwrap(), txn_number);
        assert_eq!(request.get_bool("startTransaction").unwrap(), true);
        assert_eq!(request.get_bool("autocommit").unwrap(), false);
        assert_eq!(
            session.recovery_token().unwrap(),
            &doc! { "shard": "rs0" }
        );

        // The captured token is resent on the commit.
        let (result, request) = exchange(
            &executor,
            Command::new("commitTransaction", "admin", doc! { "commitTransaction": 1 }),
            doc! { "ok": 1 },
            Some(&mut session),
        )
        .await;
        result.unwrap();
        assert_eq!(
            request.get_document("recoveryToken").unwrap(),
            &doc! { "shard": "rs0" }
        );
        assert!(!request.contains_key("startTransaction"));
    }

    #[tokio::test]
    async fn network_errors_mark_the_session_dirty() {
        let capture = Arc::new(EventCapture::default());
        let executor = CommandExecutor::new(ClusterClock::new(), Some(capture.clone()));
        let mut session = session().await;

        let (conn, mut server_end) = scripted_connection();
        let server = tokio::spawn(async move {
            // Read the request, then hang up without replying.
            let _ = Message::read_from(&mut server_end, None).await.unwrap();
            drop(server_end);
        });

        let mut ctx = OperationContext::new(executor.clock().clone()).with_session(&mut session);
        let err = executor
            .execute(
                Command::new("ping", "admin", doc! { "ping": 1 }),
                &conn,
                &mut ctx,
            )
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(err.is_network_error(), "{:?}", err);
        assert!(session.is_dirty());
        assert_eq!(capture.failed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ok_zero_replies_become_command_errors() {
        let capture = Arc::new(EventCapture::default());
        let executor = CommandExecutor::new(ClusterClock::new(), Some(capture.clone()));

        let reply = doc! {
            "ok": 0,
            "code": 11600,
            "codeName": "InterruptedAtShutdown",
            "errmsg": "interrupted at shutdown",
            "errorLabels": ["RetryableWriteError"],
        };
        let (result, _) = exchange(
            &executor,
            Command::new("insert", "db", doc! { "insert": "coll" }),
            reply,
            None,
        )
        .await;

        let err = result.unwrap_err();
        match err.kind.as_ref() {
            ErrorKind::Command(command_error) => {
                assert_eq!(command_error.code, 11600);
                assert_eq!(command_error.code_name, "InterruptedAtShutdown");
            }
            other => panic!("expected command error, got {:?}", other),
        }
        assert!(err.contains_label(crate::error::RETRYABLE_WRITE_ERROR));

        // The failure event fired before the error was returned.
        assert_eq!(capture.failed.lock().unwrap().len(), 1);
        assert!(capture.succeeded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ok_values_are_coerced_from_any_numeric_type() {
        let executor = CommandExecutor::new(ClusterClock::new(), None);

        for ok in [Bson::Double(1.0), Bson::Int64(1), Bson::Int32(1)] {
            let (result, _) = exchange(
                &executor,
                Command::new("ping", "admin", doc! { "ping": 1 }),
                doc! { "ok": ok },
                None,
            )
            .await;
            result.unwrap();
        }
    }
}
