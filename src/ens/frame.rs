//! Binary frame codec for the streaming connection.
//!
//! The server concatenates records into one websocket binary message, and a
//! record may also arrive split across messages; the decoder keeps the
//! incomplete tail in a rollover buffer between calls.
//!
//! Record layout, sizes in bytes, integers little-endian:
//!
//! ```text
//! offset  size  field
//!  0       8   message_id
//!  8       2   reserved
//! 10       1   reference_id_size (N)
//! 11       N   reference_id (UTF-8)
//! 11+N     1   payload_format (0 = JSON)
//! 12+N     4   payload_size (S)
//! 16+N     S   payload
//! ```

use bytes::{Buf, BytesMut};

use crate::error::EngineError;

/// Fixed bytes before the variable-length reference id.
const HEADER_LEN: usize = 11;
/// Fixed bytes between the reference id and the payload.
const PAYLOAD_HEADER_LEN: usize = 5;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Server-assigned sequence number, used to resume after a reconnect.
    pub message_id: u64,
    /// Subscription the record belongs to; `_heartbeat` and friends for
    /// control records.
    pub reference_id: String,
    /// Raw JSON payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// The payload parsed as JSON.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::SerdeJson`] if the payload is not valid
    /// JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Streaming decoder with the rollover buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// A decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one binary message and decode every complete record in the
    /// buffer. Incomplete trailing bytes are retained for the next call.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::PayloadFormat`] on a non-JSON payload
    /// format; the buffer is cleared because record boundaries can no longer
    /// be trusted.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, EngineError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let Some(frame_len) = self.peek_frame_len()? else {
                break;
            };

            let mut record = self.buffer.split_to(frame_len);
            let message_id = record.get_u64_le();
            record.advance(2);
            let reference_len = usize::from(record.get_u8());
            let reference_id =
                String::from_utf8_lossy(&record.chunk()[..reference_len]).into_owned();
            record.advance(reference_len);
            record.advance(1); // payload format, validated in peek
            let payload_len = record.get_u32_le() as usize;
            let payload = record.chunk()[..payload_len].to_vec();

            frames.push(Frame {
                message_id,
                reference_id,
                payload,
            });
        }

        Ok(frames)
    }

    /// Length of the next complete record, `None` while bytes are missing.
    fn peek_frame_len(&mut self) -> Result<Option<usize>, EngineError> {
        let buf = &self.buffer[..];
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let reference_len = usize::from(buf[10]);
        let payload_header_end = HEADER_LEN + reference_len + PAYLOAD_HEADER_LEN;
        if buf.len() < payload_header_end {
            return Ok(None);
        }

        let format = buf[HEADER_LEN + reference_len];
        if format != 0 {
            self.buffer.clear();
            return Err(EngineError::PayloadFormat(format));
        }

        let size_offset = HEADER_LEN + reference_len + 1;
        let payload_len = u32::from_le_bytes(
            buf[size_offset..size_offset + 4]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;

        let total = payload_header_end + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        Ok(Some(total))
    }

    /// Bytes currently waiting for the rest of their record.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
