//! Delimiter-framed JSON codec for the worker socket.
//!
//! Each frame is a serde_json document followed by one [`DELIMITER`] byte.
//! Decoding yields `Result<T, ProtocolError>` items so a malformed frame is
//! reported without tearing down the stream; only io failures end it.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{DELIMITER, ProtocolError};

pub struct DelimitedJsonCodec<T> {
    /// Bytes before this index are known to contain no delimiter.
    next_index: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for DelimitedJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelimitedJsonCodec<T> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            _phantom: PhantomData,
        }
    }

    /// Forget the scan position, e.g. after the caller cleared the buffer.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }
}

impl<T: DeserializeOwned> Decoder for DelimitedJsonCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.next_index.min(src.len());
        let Some(offset) = src[start..].iter().position(|b| *b == DELIMITER) else {
            self.next_index = src.len();
            return Ok(None);
        };

        let end = start + offset;
        self.next_index = 0;
        let frame = src.split_to(end + 1);
        let body = &frame[..end];
        tracing::trace!(frame_size_bytes = body.len(), "Decoded frame");
        Ok(Some(
            serde_json::from_slice(body).map_err(ProtocolError::Frame),
        ))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    tracing::warn!(
                        trailing_bytes = src.len(),
                        "Discarding undelimited bytes at end of stream"
                    );
                    src.clear();
                    self.next_index = 0;
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for DelimitedJsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
