use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Errors the line framing can produce.
#[derive(Debug, Error)]
pub(crate) enum FramingError {
    /// Underlying I/O problem.
    #[error("underlying i/o problem: {0}")]
    Io(#[from] io::Error),
}

/// Line framing for the sensor's wire format.
///
/// Reads frames delimited by a configurable byte (the delimiter is not
/// included in yielded frames) and appends a delimiter byte to each frame
/// it encodes.
#[derive(Debug, Clone)]
pub(crate) struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer.
    cursor: usize,

    /// How to delimit incoming byte streams.
    read_delimiter: u8,

    /// Which byte to append when writing (encoding) messages.
    write_delimiter: u8,
}

impl LinesCodec {
    pub(crate) fn new(read_delimiter: u8, write_delimiter: u8) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
        }
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', b'\n')
    }
}

impl Decoder for LinesCodec {
    type Item = Vec<u8>;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            // Split at the delimiter, getting a slice of the bytes before it.
            let line = src.split_to(actual_position);

            // Discard the delimiter by advancing the source buffer beyond it.
            src.advance(1);

            Ok(Some(line[..].to_vec()))
        } else {
            // No full frame yet. The next call sees the same buffer, possibly
            // with more data, so skip the bytes already looked at.
            self.cursor = read_to;

            Ok(None)
        }
    }
}

impl Encoder<Vec<u8>> for LinesCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        dst.extend_from_slice(&[self.write_delimiter]);

        Ok(())
    }
}
