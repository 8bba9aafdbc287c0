use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
};
use crate::{
    bson::{Document, RawDocumentBuf},
    cmap::Command,
    error::{Error, Result},
};

/// The largest reply accepted before the handshake reports the server's limit.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Note that the `response_to` field must be set
    /// manually.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        let document_payload = crate::bson::to_raw_document_buf(&command.into_document()?)?;

        Ok(Self {
            document_payload,
            response_to: 0,
            flags,
            checksum: None,
            request_id,
        })
    }

    /// Gets this message's command as a Document. If deserialization fails, returns a document
    /// containing the error.
    pub(crate) fn get_command_document(&self) -> Document {
        match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => crate::bson::doc! { "serialization error": error.to_string() },
        }
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<T: AsyncRead + Unpin + Send>(
        mut reader: T,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(&mut reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(Error::invalid_response(format!(
                "Message length {} over maximum {}",
                header.length, max_len
            )));
        }

        let Some(length_remaining) = usize::try_from(header.length)
            .ok()
            .and_then(|length| length.checked_sub(Header::LENGTH))
        else {
            return Err(Error::invalid_response(format!(
                "Message length {} is shorter than the message header",
                header.length
            )));
        };

        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        match header.op_code {
            OpCode::Message => Self::read_op_msg(&buf, &header),
        }
    }

    fn read_op_msg(mut bytes: &[u8], header: &Header) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(read_u32(&mut bytes)?);

        let mut checksum = None;
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            let Some(split) = bytes.len().checked_sub(4) else {
                return Err(Error::invalid_response(
                    "the server indicated a checksum but the reply is too short to hold one",
                ));
            };
            let (sections, mut checksum_bytes) = bytes.split_at(split);
            checksum = Some(read_u32(&mut checksum_bytes)?);
            bytes = sections;
        }

        let mut document_payload = None;
        while !bytes.is_empty() {
            let payload_type = bytes[0];
            bytes = &bytes[1..];

            match payload_type {
                0 => {
                    let length = peek_length(bytes)?;
                    let (document, rest) = bytes.split_at(length);
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(RawDocumentBuf::from_bytes(document.to_vec())?);
                    bytes = rest;
                }
                // Document sequences are never requested, so any that appear are skipped.
                1 => {
                    let length = peek_length(bytes)?;
                    bytes = &bytes[length..];
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG section payload type: {}",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "an OP_MSG response must contain exactly one payload type 0 section",
                )
            })?,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<T: AsyncWrite + Send + Unpin>(&self, mut writer: T) -> Result<()> {
        let sections = self.get_sections_bytes();

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: i32::try_from(total_length).map_err(|_| {
                Error::invalid_argument(format!(
                    "message length {} exceeds the maximum encodable length",
                    total_length
                ))
            })?,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut bytes = Vec::with_capacity(total_length);
        header.write_to(&mut bytes).await?;
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.extend_from_slice(&sections);
        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        writer.write_all(&bytes).await?;
        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::with_capacity(1 + self.document_payload.as_bytes().len());

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        sections
    }
}

fn read_u32(bytes: &mut &[u8]) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(Error::invalid_response("reply ended unexpectedly"));
    }
    let (int_bytes, rest) = bytes.split_at(4);
    *bytes = rest;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(int_bytes);
    Ok(u32::from_le_bytes(buf))
}

/// Reads the little-endian length prefix at the start of `bytes` without consuming it, checking
/// that the whole prefixed value is present.
fn peek_length(bytes: &[u8]) -> Result<usize> {
    let mut prefix = bytes;
    let length = read_u32(&mut prefix)? as usize;
    if length < 4 || length > bytes.len() {
        return Err(Error::invalid_response(format!(
            "section length {} does not fit in the remaining {} bytes of the reply",
            length,
            bytes.len()
        )));
    }
    Ok(length)
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Message, MessageFlags};
    use crate::{bson::doc, cmap::Command, error::ErrorKind};

    #[tokio::test]
    async fn op_msg_framing() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(7)).unwrap();

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(length as usize, bytes.len());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2013i32.to_le_bytes());

        let read = Message::read_from(bytes.as_slice(), None).await.unwrap();
        assert_eq!(read.request_id, Some(7));
        assert_eq!(
            read.get_command_document(),
            doc! { "ping": 1, "$db": "admin" }
        );
    }

    #[tokio::test]
    async fn checksum_is_tolerated() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let mut message = Message::from_command(command, Some(1)).unwrap();
        message.flags |= MessageFlags::CHECKSUM_PRESENT;
        message.checksum = Some(0xdead_beef);

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        let read = Message::read_from(bytes.as_slice(), None).await.unwrap();
        assert_eq!(read.checksum, Some(0xdead_beef));
        assert_eq!(read.get_command_document().get_i32("ping").unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_reply_is_rejected() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, None).unwrap();

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        let error = Message::read_from(bytes.as_slice(), Some(20))
            .await
            .unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn truncated_section_is_rejected() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, None).unwrap();

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        // Claim the document is longer than the bytes that follow it.
        let doc_start = 16 + 4 + 1;
        let bogus = (bytes.len() as i32).to_le_bytes();
        bytes[doc_start..doc_start + 4].copy_from_slice(&bogus);

        let error = Message::read_from(bytes.as_slice(), None).await.unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
    }
}
