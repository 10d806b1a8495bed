use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use tokio::io::DuplexStream;

use super::{
    pooled::PooledConnection,
    wire::{Message, MessageSection},
    ConnectionDescription, PendingConnection,
};
use crate::{
    error::ErrorKind,
    event::pool::PoolEventEmitter,
    options::ServerAddress,
    runtime::AsyncStream,
};

/// A connection wired to an in-memory duplex stream; the returned server end
/// reads request frames and writes reply frames.
pub(crate) fn scripted_connection() -> (PooledConnection, DuplexStream) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let address = ServerAddress::new("localhost", 27017);
    let pending = PendingConnection {
        id: 1,
        address: address.clone(),
        generation: 0,
        event_emitter: PoolEventEmitter::new(None),
        time_created: Instant::now(),
    };
    let conn = PooledConnection::new(pending, AsyncStream::Memory(client_end));
    conn.mark_opened(ConnectionDescription::new_testing(address));
    (conn, server_end)
}

pub(crate) fn reply_message(response_to: i32, body: Document) -> Message {
    let mut message = Message::new(body, Some(0));
    message.response_to = response_to;
    message
}

pub(crate) fn request_body(message: &Message) -> &Document {
    match &message.sections[0] {
        MessageSection::Document(doc) => doc,
        other => panic!("expected document section, got {:?}", other),
    }
}

/// Three concurrent callers with known request ids; the server answers them
/// in reverse order. Each caller must receive the reply bearing its own id.
#[tokio::test]
async fn pipelined_replies_are_correlated_by_request_id() {
    let (conn, mut server_end) = scripted_connection();
    let conn = Arc::new(conn);

    let server = tokio::spawn(async move {
        let mut requests = Vec::new();
        for _ in 0..3 {
            let request = Message::read_from(&mut server_end, None).await.unwrap();
            let tag = request_body(&request).get_i32("tag").unwrap();
            requests.push((request.request_id.unwrap(), tag));
        }

        // Reply in the reverse of arrival order.
        for (request_id, tag) in requests.into_iter().rev() {
            reply_message(request_id, doc! { "ok": 1, "tag": tag })
                .write_to(&mut server_end)
                .await
                .unwrap();
        }
        server_end
    });

    let callers: Vec<_> = [100, 101, 102]
        .into_iter()
        .map(|id| {
            let conn = conn.clone();
            tokio::spawn(async move {
                let message = Message::new(
                    doc! { "hello": 1, "$db": "admin", "tag": id },
                    Some(id),
                );
                let reply = conn.send_and_receive(message, None, false).await.unwrap();
                (id, reply)
            })
        })
        .collect();

    for caller in callers {
        let (id, reply) = caller.await.unwrap();
        assert_eq!(reply.response_to, id);
        let body = reply.single_document_response().unwrap();
        assert_eq!(body.get_i32("tag").unwrap(), id);
    }

    server.await.unwrap();
}

/// A deadline on one exchange must interrupt the blocked read by closing the
/// connection; all later use fails with the stream-closed kind.
#[tokio::test]
async fn deadline_expiry_closes_the_connection() {
    let (conn, mut server_end) = scripted_connection();

    // The server reads the request but never replies.
    let server = tokio::spawn(async move {
        let _ = Message::read_from(&mut server_end, None).await;
        // Hold the stream open so the failure is the deadline, not EOF.
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(server_end);
    });

    let message = Message::new(doc! { "ping": 1, "$db": "admin" }, Some(7));
    let started = Instant::now();
    let err = conn
        .send_and_receive(
            message,
            Some(Instant::now() + Duration::from_millis(100)),
            false,
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(conn.is_closed());

    let message = Message::new(doc! { "ping": 1, "$db": "admin" }, Some(8));
    let err = conn.send_and_receive(message, None, false).await.unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::StreamClosed { .. }),
        "{:?}",
        err
    );

    server.abort();
}

/// A read failure fails every outstanding waiter on the connection, not just
/// the one holding the receive lock.
#[tokio::test]
async fn read_failure_fails_all_outstanding_waiters() {
    let (conn, mut server_end) = scripted_connection();
    let conn = Arc::new(conn);

    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let _ = Message::read_from(&mut server_end, None).await.unwrap();
        }
        // Hang up without replying to either request.
        drop(server_end);
    });

    let callers: Vec<_> = [200, 201]
        .into_iter()
        .map(|id| {
            let conn = conn.clone();
            tokio::spawn(async move {
                let message = Message::new(doc! { "ping": 1, "$db": "admin", "tag": id }, Some(id));
                conn.send_and_receive(message, None, false).await
            })
        })
        .collect();

    for caller in callers {
        let result = caller.await.unwrap();
        assert!(result.is_err());
    }
    assert!(conn.is_closed());

    server.await.unwrap();
}

/// Replies routed to a waiter that already gave up are discarded without
/// disturbing other exchanges.
#[tokio::test]
async fn late_replies_for_abandoned_requests_are_discarded() {
    let (conn, mut server_end) = scripted_connection();
    let conn = Arc::new(conn);

    let server = tokio::spawn(async move {
        let first = Message::read_from(&mut server_end, None).await.unwrap();
        let second = Message::read_from(&mut server_end, None).await.unwrap();

        // Reply to the second request only; the first caller is left hanging.
        reply_message(second.request_id.unwrap(), doc! { "ok": 1 })
            .write_to(&mut server_end)
            .await
            .unwrap();
        // Then reply to the first, which by now nobody is waiting for.
        reply_message(first.request_id.unwrap(), doc! { "ok": 1 })
            .write_to(&mut server_end)
            .await
            .unwrap();
        server_end
    });

    let abandoned = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let message = Message::new(doc! { "ping": 1, "$db": "admin" }, Some(300));
            conn.send_and_receive(message, None, false).await
        })
    };
    // Give the abandoned request time to be written before cancelling it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();

    let message = Message::new(doc! { "ping": 1, "$db": "admin" }, Some(301));
    let reply = conn.send_and_receive(message, None, false).await.unwrap();
    assert_eq!(reply.response_to, 301);

    server.await.unwrap();
}

/// A reply flagged more-to-come leaves the connection in streaming mode:
/// sends are rejected and the follow-up reply is read unprompted.
#[tokio::test]
async fn streamed_replies_are_read_without_a_request() {
    use super::wire::MessageFlags;

    let (conn, mut server_end) = scripted_connection();

    let server = tokio::spawn(async move {
        let request = Message::read_from(&mut server_end, None).await.unwrap();
        let request_id = request.request_id.unwrap();

        let mut first = reply_message(request_id, doc! { "ok": 1, "seq": 1 });
        first.flags |= MessageFlags::MORE_TO_COME;
        first.write_to(&mut server_end).await.unwrap();

        reply_message(request_id, doc! { "ok": 1, "seq": 2 })
            .write_to(&mut server_end)
            .await
            .unwrap();
        server_end
    });

    let message = Message::new(doc! { "hello": 1, "$db": "admin" }, Some(400));
    let reply = conn.send_and_receive(message, None, false).await.unwrap();
    assert_eq!(
        reply.single_document_response().unwrap().get_i32("seq"),
        Ok(1)
    );
    assert!(conn.is_streaming());

    // New sends are rejected while a streamed reply is pending.
    let message = Message::new(doc! { "ping": 1, "$db": "admin" }, Some(401));
    let err = conn.send_and_receive(message, None, false).await.unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::Internal { .. }),
        "{:?}",
        err
    );

    let more = conn.receive_more(None).await.unwrap();
    assert_eq!(
        more.single_document_response().unwrap().get_i32("seq"),
        Ok(2)
    );
    assert!(!conn.is_streaming());

    server.await.unwrap();
}
