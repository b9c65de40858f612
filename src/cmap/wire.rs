//! OP_MSG-shaped framing (spec: "wire protocol framing... assumed available as a `Connection`
//! capability", carried here in minimal form so the crate is runnable end-to-end).
//!
//! Only what a `hello`/legacy-hello probe needs is implemented: a single `Document` section per
//! message, the `moreToCome` flag that backs streaming/exhaust responses, and no compression or
//! checksums.

use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, Result};

const OP_MSG: i32 = 2013;
const HEADER_LEN: i32 = 16;

bitflags::bitflags! {
    struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b0000_0001;
        const MORE_TO_COME     = 0b0000_0010;
        const EXHAUST_ALLOWED  = 0b0001_0000_0000_0000_0000;
    }
}

/// A single OP_MSG round carrying exactly one document payload.
pub(crate) struct WireMessage {
    pub(crate) response_to: i32,
    pub(crate) document: Document,
    /// Set on outgoing messages to request exhaust mode; read back on incoming ones to learn
    /// whether the server will push another frame unprompted.
    pub(crate) more_to_come: bool,
}

impl WireMessage {
    pub(crate) fn command(document: Document, exhaust_allowed: bool) -> Self {
        WireMessage {
            response_to: 0,
            document,
            more_to_come: exhaust_allowed,
        }
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        request_id: i32,
    ) -> Result<()> {
        let mut body = Vec::new();
        self.document.to_writer(&mut body)?;

        let mut flags = MessageFlags::empty();
        if self.more_to_come {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        // payload type 0 + raw document bytes.
        let section_len = 1 + body.len() as i32;
        let total_len = HEADER_LEN + 4 + section_len;

        writer.write_i32_le(total_len).await?;
        writer.write_i32_le(request_id).await?;
        writer.write_i32_le(self.response_to).await?;
        writer.write_i32_le(OP_MSG).await?;
        writer.write_u32_le(flags.bits()).await?;
        writer.write_u8(0).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let total_len = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = reader.read_i32_le().await?;
        let _ = request_id;

        if op_code != OP_MSG {
            return Err(ErrorKind::InvalidResponse {
                message: format!("unsupported wire opcode {op_code}"),
            }
            .into());
        }

        let flags = MessageFlags::from_bits_truncate(reader.read_u32_le().await?);
        let mut remaining = total_len - HEADER_LEN - 4;

        let payload_type = reader.read_u8().await?;
        remaining -= 1;
        if payload_type != 0 {
            return Err(ErrorKind::InvalidResponse {
                message: format!("unsupported OP_MSG payload type {payload_type}"),
            }
            .into());
        }

        let mut body = vec![0u8; remaining.max(0) as usize];
        reader.read_exact(&mut body).await?;
        let document: Document = bson::from_slice(&body)?;

        Ok(WireMessage {
            response_to,
            document,
            more_to_come: flags.contains(MessageFlags::MORE_TO_COME),
        })
    }
}
