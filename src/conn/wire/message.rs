use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id, DEFAULT_MAX_MESSAGE_SIZE_BYTES,
};
use crate::{
    compression::{decompress_message, Compressor},
    error::{Error, ErrorKind, Result},
};

/// A decoded wire protocol message. Commands are always sent as op-messages;
/// replies are accepted as op-messages, compressed envelopes wrapping either
/// supported frame, or legacy reply frames.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: Option<i32>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
}

bitflags! {
    /// The bitwise flags of an op-message.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A section of an op-message: either a single command/reply document or an
/// identified sequence of documents.
#[derive(Debug)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl Message {
    /// Creates a message carrying the given single command document.
    pub(crate) fn new(body: Document, request_id: Option<i32>) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(body)],
            checksum: None,
        }
    }

    /// The first document contained in this message.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .find_map(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { documents, .. } => documents.into_iter().next(),
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no document included in server reply".to_string(),
                }
                .into()
            })
    }

    /// A clone of the command document carried by this message, for
    /// monitoring.
    pub(crate) fn document_payload(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            MessageSection::Document(doc) => Some(doc),
            MessageSection::Sequence { .. } => None,
        })
    }

    /// Reads a full frame from `reader` and decodes it, enforcing the size and
    /// opcode invariants.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_message_size = max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        if header.length < Header::LENGTH as i32 {
            return Err(Error::invalid_frame(format!(
                "message length {} is smaller than the header alone",
                header.length
            )));
        }
        if header.length > max_message_size {
            return Err(Error::invalid_frame(format!(
                "message length {} exceeds the maximum of {}",
                header.length, max_message_size
            )));
        }

        let mut body = vec![0u8; header.length as usize - Header::LENGTH];
        reader.read_exact(&mut body).await?;

        let decoded = match header.op_code {
            OpCode::Message => Self::decode_op_message(header.response_to, &body),
            OpCode::Reply => Self::decode_legacy_reply(header.response_to, &body),
            OpCode::Compressed => Self::decode_compressed(header.response_to, &body),
            OpCode::Query => Err(Error::invalid_frame(
                "unexpected opcode OP_QUERY in a server reply",
            )),
        };
        decoded.map(|mut message| {
            message.request_id = Some(header.request_id);
            message
        })
    }

    fn decode_compressed(response_to: i32, body: &[u8]) -> Result<Self> {
        const ENVELOPE_LENGTH: usize = 9;

        if body.len() < ENVELOPE_LENGTH {
            return Err(Error::invalid_frame(
                "compressed message is too short to hold its envelope",
            ));
        }

        let original_op_code = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().unwrap());
        let compressor_id = body[8];

        if uncompressed_size < 0 {
            return Err(Error::invalid_frame(format!(
                "compressed message advertises a negative uncompressed size {}",
                uncompressed_size
            )));
        }

        let decompressed = decompress_message(&body[ENVELOPE_LENGTH..], compressor_id)?;
        if decompressed.len() != uncompressed_size as usize {
            return Err(Error::invalid_frame(format!(
                "compressed message advertised {} uncompressed bytes but expanded to {}",
                uncompressed_size,
                decompressed.len()
            )));
        }

        match OpCode::from_i32(original_op_code)? {
            OpCode::Message => Self::decode_op_message(response_to, &decompressed),
            OpCode::Reply => Self::decode_legacy_reply(response_to, &decompressed),
            other => Err(Error::invalid_frame(format!(
                "unexpected opcode {:?} inside a compressed envelope",
                other
            ))),
        }
    }

    fn decode_op_message(response_to: i32, body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::invalid_frame("op-message is missing its flag bits"));
        }
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(
            body[0..4].try_into().unwrap(),
        ));

        let checksum_length = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };
        if body.len() < 4 + checksum_length {
            return Err(Error::invalid_frame("op-message is missing its checksum"));
        }

        let sections_end = body.len() - checksum_length;
        let mut offset = 4;
        let mut sections = Vec::new();

        while offset < sections_end {
            let (section, read) = MessageSection::decode(&body[offset..sections_end])?;
            sections.push(section);
            offset += read;
        }

        let checksum = if checksum_length > 0 {
            Some(u32::from_le_bytes(
                body[sections_end..].try_into().unwrap(),
            ))
        } else {
            None
        };

        Ok(Self {
            request_id: None,
            response_to,
            flags,
            sections,
            checksum,
        })
    }

    fn decode_legacy_reply(response_to: i32, body: &[u8]) -> Result<Self> {
        const PREFIX_LENGTH: usize = 4 + 8 + 4 + 4;

        if body.len() < PREFIX_LENGTH {
            return Err(Error::invalid_frame(
                "legacy reply is too short to hold its fixed fields",
            ));
        }

        // response_flags and cursor_id are decoded but have no bearing on
        // routing; starting_from likewise.
        let _response_flags = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let _cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
        let _starting_from = i32::from_le_bytes(body[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());

        if number_returned < 0 {
            return Err(Error::invalid_frame(format!(
                "legacy reply advertises a negative document count {}",
                number_returned
            )));
        }

        let mut remainder = &body[PREFIX_LENGTH..];
        let mut documents = Vec::new();
        while !remainder.is_empty() {
            let document = Document::from_reader(&mut remainder)
                .map_err(|e| Error::invalid_frame(format!("malformed reply document: {}", e)))?;
            documents.push(document);
        }

        if documents.len() != number_returned as usize {
            return Err(Error::invalid_frame(format!(
                "legacy reply advertised {} documents but contained {}",
                number_returned,
                documents.len()
            )));
        }

        Ok(Self {
            request_id: None,
            response_to,
            flags: MessageFlags::empty(),
            sections: documents.into_iter().map(MessageSection::Document).collect(),
            checksum: None,
        })
    }

    /// Serializes this message as an op-message frame and writes it to
    /// `writer`. Returns the request id the frame was sent with.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let sections = self.encode_sections()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let request_id = self.request_id.unwrap_or_else(next_request_id);
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections).await?;
        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }
        writer.flush().await?;

        Ok(request_id)
    }

    /// Serializes this message inside a compressed envelope and writes it to
    /// `writer`. Returns the request id the frame was sent with.
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<i32> {
        let sections = self.encode_sections()?;
        let flag_bytes = self.flags.bits().to_le_bytes();
        let uncompressed_size = (flag_bytes.len() + sections.len()) as i32;
        let compressed = compressor.compress(&flag_bytes, &sections)?;

        let total_length = Header::LENGTH + 9 + compressed.len();

        let request_id = self.request_id.unwrap_or_else(next_request_id);
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer.write_all(&uncompressed_size.to_le_bytes()).await?;
        writer.write_all(&[compressor.id()]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        Ok(request_id)
    }

    fn encode_sections(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for section in &self.sections {
            section.encode(&mut bytes)?;
        }
        Ok(bytes)
    }
}

impl MessageSection {
    /// Decodes one section from the front of `bytes`, returning it along with
    /// the number of bytes consumed.
    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let payload_type = bytes[0];
        let payload = &bytes[1..];

        match payload_type {
            0 => {
                let (document, read) = read_document(payload)?;
                Ok((MessageSection::Document(document), 1 + read))
            }
            1 => {
                if payload.len() < 4 {
                    return Err(Error::invalid_frame(
                        "document sequence section is missing its size",
                    ));
                }
                let size = i32::from_le_bytes(payload[0..4].try_into().unwrap());
                if size < 4 || size as usize > payload.len() {
                    return Err(Error::invalid_frame(format!(
                        "document sequence section advertises impossible size {}",
                        size
                    )));
                }
                let section = &payload[4..size as usize];

                let nul = section.iter().position(|b| *b == 0).ok_or_else(|| {
                    Error::invalid_frame("document sequence identifier is unterminated")
                })?;
                let identifier = std::str::from_utf8(&section[..nul])
                    .map_err(|_| {
                        Error::invalid_frame("document sequence identifier is not valid UTF-8")
                    })?
                    .to_string();

                let mut remainder = &section[nul + 1..];
                let mut documents = Vec::new();
                while !remainder.is_empty() {
                    let (document, read) = read_document(remainder)?;
                    documents.push(document);
                    remainder = &remainder[read..];
                }

                Ok((
                    MessageSection::Sequence {
                        identifier,
                        documents,
                    },
                    1 + size as usize,
                ))
            }
            other => Err(Error::invalid_frame(format!(
                "unknown op-message payload type {}",
                other
            ))),
        }
    }

    fn encode(&self, bytes: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(document) => {
                bytes.push(0);
                document.to_writer(&mut *bytes)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                bytes.push(1);

                let mut contents = Vec::new();
                contents.extend_from_slice(identifier.as_bytes());
                contents.push(0);
                for document in documents {
                    document.to_writer(&mut contents)?;
                }

                let size = (4 + contents.len()) as i32;
                bytes.extend_from_slice(&size.to_le_bytes());
                bytes.extend_from_slice(&contents);
            }
        }

        Ok(())
    }
}

/// Parses one BSON document from the front of `bytes`, returning it with the
/// number of bytes it occupied.
fn read_document(bytes: &[u8]) -> Result<(Document, usize)> {
    if bytes.len() < 5 {
        return Err(Error::invalid_frame("truncated document in message body"));
    }
    let length = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if length < 5 || length as usize > bytes.len() {
        return Err(Error::invalid_frame(format!(
            "document advertises impossible length {}",
            length
        )));
    }

    let document = Document::from_reader(&mut &bytes[..length as usize])
        .map_err(|e| Error::invalid_frame(format!("malformed document in message body: {}", e)))?;
    Ok((document, length as usize))
}
