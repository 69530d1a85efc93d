//! Incremental splitter for newline-delimited JSON.
//!
//! Chunks from the HTTP body arrive at arbitrary boundaries; the decoder
//! buffers partial lines and hands out complete ones without the trailing
//! newline. Blank lines are skipped.

use bytes::{Bytes, BytesMut};

use crate::client::BackendError;

/// Longest line accepted before the stream is treated as corrupt.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, BackendError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line.freeze());
            }
        }
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_LINE_LEN {
            return Err(BackendError::Decode(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        Ok(lines)
    }

    /// Whatever is left once the body ends, if it is not blank.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        let rest = self.buf.split().freeze();
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }
}
