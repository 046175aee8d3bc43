use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{core::error::ParseError, message::Message};

/// The longest length prefix accepted before the separating space.
const MAX_PREFIX_LEN: usize = 10;

/// The default upper bound on a single message's length.
const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Frames the text wire format: each message is delimited by its own length prefix.
///
/// Line terminators between messages are skipped, so newline-separated streams decode as well.
pub struct MessageCodec {
    max_frame_length: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_data(e: ParseError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let skip = src
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n'))
            .count();
        src.advance(skip);

        let prefix_len = match src.iter().take(MAX_PREFIX_LEN + 1).position(|b| *b == b' ') {
            Some(i) => i,
            None if src.len() <= MAX_PREFIX_LEN => return Ok(None),
            None => {
                let prefix = String::from_utf8_lossy(&src[..MAX_PREFIX_LEN]).into_owned();
                return Err(invalid_data(ParseError::InvalidLength(prefix)));
            }
        };

        let prefix = &src[..prefix_len];
        let len = std::str::from_utf8(prefix)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|len| *len > prefix_len && *len <= self.max_frame_length)
            .ok_or_else(|| {
                invalid_data(ParseError::InvalidLength(
                    String::from_utf8_lossy(prefix).into_owned(),
                ))
            })?;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len);
        let line = std::str::from_utf8(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Message::parse(line).map(Some).map_err(invalid_data)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = message.serialize();
        if line.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {} bytes exceeds the frame limit", line.len()),
            ));
        }

        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
