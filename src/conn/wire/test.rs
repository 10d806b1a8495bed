use bson::doc;

use super::{
    header::{Header, OpCode},
    message::{Message, MessageFlags, MessageSection},
    next_request_id,
};
use crate::error::ErrorKind;

fn is_framing_error(err: &crate::error::Error) -> bool {
    matches!(err.kind.as_ref(), ErrorKind::InvalidFrame { .. })
}

async fn encode(message: &Message) -> Vec<u8> {
    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();
    bytes
}

#[tokio::test]
async fn round_trips_an_op_message() {
    let body = doc! { "hello": 1, "$db": "admin", "count": 42_i64 };
    let message = Message::new(body.clone(), Some(17));

    let bytes = encode(&message).await;
    let decoded = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap();

    assert_eq!(decoded.request_id, Some(17));
    assert_eq!(decoded.response_to, 0);
    assert_eq!(decoded.single_document_response().unwrap(), body);
}

#[tokio::test]
async fn round_trips_a_document_sequence() {
    let mut message = Message::new(doc! { "insert": "coll", "$db": "db" }, Some(5));
    message.sections.push(MessageSection::Sequence {
        identifier: "documents".to_string(),
        documents: vec![doc! { "x": 1 }, doc! { "x": 2 }],
    });

    let bytes = encode(&message).await;
    let decoded = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap();

    assert_eq!(decoded.sections.len(), 2);
    match &decoded.sections[1] {
        MessageSection::Sequence {
            identifier,
            documents,
        } => {
            assert_eq!(identifier, "documents");
            assert_eq!(documents, &vec![doc! { "x": 1 }, doc! { "x": 2 }]);
        }
        other => panic!("expected sequence section, got {:?}", other),
    }
}

#[tokio::test]
async fn rejects_an_undersized_length() {
    let mut bytes = encode(&Message::new(doc! { "ping": 1 }, Some(1))).await;
    bytes[0..4].copy_from_slice(&8_i32.to_le_bytes());

    let err = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap_err();
    assert!(is_framing_error(&err), "{:?}", err);
}

#[tokio::test]
async fn rejects_an_oversized_length() {
    let bytes = encode(&Message::new(doc! { "ping": 1 }, Some(1))).await;

    let err = Message::read_from(&mut bytes.as_slice(), Some(20))
        .await
        .unwrap_err();
    assert!(is_framing_error(&err), "{:?}", err);
}

#[tokio::test]
async fn rejects_an_unknown_opcode() {
    let mut bytes = encode(&Message::new(doc! { "ping": 1 }, Some(1))).await;
    bytes[12..16].copy_from_slice(&9999_i32.to_le_bytes());

    let err = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap_err();
    assert!(is_framing_error(&err), "{:?}", err);
}

fn legacy_reply_frame(number_returned: i32, docs: &[bson::Document]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0_i32.to_le_bytes()); // response flags
    body.extend_from_slice(&0_i64.to_le_bytes()); // cursor id
    body.extend_from_slice(&0_i32.to_le_bytes()); // starting from
    body.extend_from_slice(&number_returned.to_le_bytes());
    for doc in docs {
        doc.to_writer(&mut body).unwrap();
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&((Header::LENGTH + body.len()) as i32).to_le_bytes());
    bytes.extend_from_slice(&1_i32.to_le_bytes()); // request id
    bytes.extend_from_slice(&7_i32.to_le_bytes()); // response to
    bytes.extend_from_slice(&(OpCode::Reply as i32).to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes
}

#[tokio::test]
async fn reads_a_legacy_reply() {
    let bytes = legacy_reply_frame(1, &[doc! { "ok": 1 }]);
    let decoded = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap();
    assert_eq!(decoded.response_to, 7);
    assert_eq!(decoded.single_document_response().unwrap(), doc! { "ok": 1 });
}

#[tokio::test]
async fn rejects_a_negative_document_count() {
    let bytes = legacy_reply_frame(-1, &[]);
    let err = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap_err();
    assert!(is_framing_error(&err), "{:?}", err);
}

#[cfg(feature = "zlib-compression")]
mod compressed {
    use super::*;
    use crate::compression::Compressor;

    async fn encode_compressed(message: &Message) -> Vec<u8> {
        let mut bytes = Vec::new();
        message
            .write_compressed_to(&mut bytes, &Compressor::Zlib { level: None })
            .await
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn round_trips_a_compressed_message() {
        let body = doc! { "find": "coll", "$db": "db" };
        let message = Message::new(body.clone(), Some(3));

        let bytes = encode_compressed(&message).await;
        let decoded = Message::read_from(&mut bytes.as_slice(), None)
            .await
            .unwrap();

        assert_eq!(decoded.single_document_response().unwrap(), body);
    }

    #[tokio::test]
    async fn rejects_a_size_mismatch() {
        let message = Message::new(doc! { "find": "coll", "$db": "db" }, Some(3));
        let mut bytes = encode_compressed(&message).await;

        // Corrupt the advertised uncompressed size in the envelope.
        let advertised = i32::from_le_bytes(bytes[20..24].try_into().unwrap());
        bytes[20..24].copy_from_slice(&(advertised + 1).to_le_bytes());

        let err = Message::read_from(&mut bytes.as_slice(), None)
            .await
            .unwrap_err();
        assert!(is_framing_error(&err), "{:?}", err);
    }
}

#[test]
fn request_ids_are_monotone() {
    let first = next_request_id();
    let second = next_request_id();
    let third = next_request_id();
    assert!(first < second && second < third);
}

#[tokio::test]
async fn message_flags_round_trip() {
    let mut message = Message::new(doc! { "ping": 1 }, Some(9));
    message.flags |= MessageFlags::EXHAUST_ALLOWED;

    let bytes = encode(&message).await;
    let decoded = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap();
    assert!(decoded.flags.contains(MessageFlags::EXHAUST_ALLOWED));
}
