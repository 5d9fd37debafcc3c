//! Length-prefixed framing for relayed records.
//!
//! Each frame is a big-endian `u32` payload length followed by the
//! `postcard` encoding of one [`LogRecord`]. The decoder is incremental: feed
//! it whatever the socket returned and pull complete records out.

use thiserror::Error;

use crate::record::LogRecord;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload accepted on either side of the wire.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record could not be serialised.
    #[error("failed to encode log record: {0}")]
    Encode(#[source] postcard::Error),
    /// A complete frame held bytes that are not a record.
    #[error("failed to decode log record: {0}")]
    Decode(#[source] postcard::Error),
    /// A frame length exceeded [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared or encoded payload length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Encodes `record` as one complete frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] when serialisation fails and
/// [`CodecError::FrameTooLarge`] when the payload exceeds the limit.
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    let payload = postcard::to_stdvec(record).map_err(CodecError::Encode)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_LEN)
        .ok_or(CodecError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends raw bytes read from the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete record, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] for an oversized length prefix
    /// and [`CodecError::Decode`] for a malformed payload. The stream cannot be
    /// resynchronised after either, so callers should drop the connection.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, CodecError> {
        let Some(header) = self.buffer.first_chunk::<FRAME_HEADER_LEN>() else {
            return Ok(None);
        };
        let len = usize::try_from(u32::from_be_bytes(*header)).unwrap_or(usize::MAX);
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let end = FRAME_HEADER_LEN + len;
        let Some(payload) = self.buffer.get(FRAME_HEADER_LEN..end) else {
            return Ok(None);
        };
        let record = postcard::from_bytes(payload).map_err(CodecError::Decode)?;
        self.buffer.drain(..end);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordLevel;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(RecordLevel::Info, "salt.master", message).with_field("jid", "20240101")
    }

    #[test]
    fn frame_starts_with_big_endian_length() {
        let frame = encode_frame(&record("hello")).expect("encode");
        let (header, payload) = frame.split_at(FRAME_HEADER_LEN);
        let declared = u32::from_be_bytes(header.try_into().expect("four bytes"));
        assert_eq!(usize::try_from(declared).expect("fits"), payload.len());
    }

    #[test]
    fn decoder_reassembles_split_frames() {
        let first = record("first");
        let second = record("second");
        let mut wire = encode_frame(&first).expect("encode");
        wire.extend(encode_frame(&second).expect("encode"));

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk);
            while let Some(record) = decoder.next_record().expect("decode") {
                decoded.push(record);
            }
        }
        assert_eq!(decoded, vec![first, second]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn partial_header_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 0]);
        assert!(decoder.next_record().expect("no error").is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decoder.next_record(),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&2_u32.to_be_bytes());
        decoder.feed(&[0xff, 0xff]);
        assert!(matches!(decoder.next_record(), Err(CodecError::Decode(_))));
    }
}
