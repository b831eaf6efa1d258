use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Cursor};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Frame};

/// Default upper bound on the bytes buffered for a single, not yet complete, request.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Decodes requests and encodes replies.
///
/// A malformed request is not a stream error: it is yielded as an `Err` item and the codec keeps
/// decoding the frames that follow. Only transport problems surface as `io::Error`, which is what
/// ends a `FramedRead`.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Vec<Bytes>, frame::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let res = frame::parse_request(&mut cursor);
        let position = cursor.position() as usize;

        match res {
            Ok(parts) => {
                // Remove the parsed frame from the buffer.
                src.advance(position);
                Ok(Some(Ok(parts)))
            }
            Err(frame::Error::Incomplete) => {
                // There is no way to resynchronise in the middle of a frame, so a client that
                // keeps sending one is disconnected.
                if src.len() > self.max_frame_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame size exceeds limit",
                    ));
                }
                Ok(None)
            }
            Err(err) if err.is_size_guard() => {
                src.advance(position);
                Ok(Some(Err(err)))
            }
            Err(err) => {
                // Drop the rest of the malformed line.
                let skip = src[position..]
                    .windows(2)
                    .position(|window| window == b"\r\n")
                    .map(|index| position + index + 2)
                    .unwrap_or(src.len());
                src.advance(skip);
                Ok(Some(Err(err)))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.serialize_into(dst);
        Ok(())
    }
}
