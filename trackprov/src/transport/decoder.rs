//! Byte-to-text decoding for the device's log stream.
//!
//! Tracker firmware prints ESP-IDF style logs, which are often coloured with
//! ANSI escapes and arrive in arbitrary chunks. The decoder runs the bytes
//! through a `vte` parser so escape sequences are dropped and multi-byte UTF-8
//! characters split across two reads are reassembled.

use std::io;

use bytes::BytesMut;
use futures_core::Stream;
use futures_util::stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use vte::{Parser, Perform};

/// Read buffer size for one underlying read.
const READ_CHUNK: usize = 1024;

/// Stateful decoder turning raw serial bytes into printable text.
pub struct TextDecoder {
    parser: Parser,
    sink: TextSink,
}

/// Collects printable output from the parser.
#[derive(Default)]
struct TextSink {
    out: String,
}

impl Perform for TextSink {
    fn print(&mut self, c: char) {
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        // Keep line structure, drop bells, backspaces and other C0 controls
        if matches!(byte, b'\n' | b'\r' | b'\t') {
            self.out.push(byte as char);
        }
    }
}

impl TextDecoder {
    /// Create a decoder in the ground state.
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: TextSink::default(),
        }
    }

    /// Feed bytes and return whatever text became complete.
    ///
    /// Incomplete UTF-8 sequences and escape sequences are carried over to
    /// the next call.
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.parser.advance(&mut self.sink, data);
        std::mem::take(&mut self.sink.out)
    }
}

impl Default for TextDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a reader into a lazy stream of decoded text chunks.
///
/// The stream ends at EOF, or right after yielding the first read error.
/// It takes ownership of the reader, so it cannot be restarted.
pub fn read_chunks<R>(reader: R) -> impl Stream<Item = io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    let state = Some((reader, TextDecoder::new(), BytesMut::with_capacity(READ_CHUNK)));

    stream::unfold(state, |state| async move {
        let (mut reader, mut decoder, mut buf) = state?;
        loop {
            buf.clear();
            match reader.read_buf(&mut buf).await {
                Ok(0) => return None,
                Ok(_) => {
                    let text = decoder.decode(&buf);
                    // A chunk holding only escape bytes decodes to nothing
                    if !text.is_empty() {
                        return Some((Ok(text), Some((reader, decoder, buf))));
                    }
                }
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}
