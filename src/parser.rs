//! Result stream decoder.
//!
//! Sits between the pipeline's output stream and the normal log destination.
//! Every chunk written through it is passed on unchanged, and any tagged
//! records inside the chunk are decoded and appended to the result history.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, RwLock};

use crate::codec::{self, RequestResult, RECORD_PATTERN};
use crate::error::Result;

/// A sink for log text that mines result records out of it
pub trait LogParser: Send + Sync {
    /// Process one chunk of log text
    ///
    /// Fails only when a tagged record does not decode, which means the
    /// producer side is broken; callers treat that as fatal.
    fn write_chunk(&self, chunk: &str) -> Result<()>;

    /// Snapshot of all results decoded so far, in the order they were seen
    fn history(&self) -> Vec<RequestResult>;

    fn len(&self) -> usize {
        self.history().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Active parser: tees text to `writer` and accumulates results
pub struct ResultLogParser<W> {
    results: RwLock<Vec<RequestResult>>,
    writer: Mutex<W>,
}

impl<W: Write + Send> ResultLogParser<W> {
    pub fn new(writer: W) -> Self {
        Self {
            results: RwLock::new(Vec::new()),
            writer: Mutex::new(writer),
        }
    }

    fn parse(&self, chunk: &str) -> Result<()> {
        let decoded = RECORD_PATTERN
            .find_iter(chunk)
            .map(|m| codec::decode(m.as_str()))
            .collect::<Result<Vec<_>>>()?;

        if decoded.is_empty() {
            return Ok(());
        }

        let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
        results.extend(decoded);
        Ok(())
    }
}

impl<W: Write + Send> LogParser for ResultLogParser<W> {
    fn write_chunk(&self, chunk: &str) -> Result<()> {
        {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_all(chunk.as_bytes())?;
            writer.flush()?;
        }
        self.parse(chunk)
    }

    fn history(&self) -> Vec<RequestResult> {
        self.results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn len(&self) -> usize {
        self.results.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Parser used when result mining is turned off: swallows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLogParser;

impl LogParser for DisabledLogParser {
    fn write_chunk(&self, _chunk: &str) -> Result<()> {
        Ok(())
    }

    fn history(&self) -> Vec<RequestResult> {
        Vec::new()
    }
}

/// Pick the parser variant for the result-mining flag
pub fn parser_for<W>(enabled: bool, writer: W) -> Arc<dyn LogParser>
where
    W: Write + Send + 'static,
{
    if enabled {
        Arc::new(ResultLogParser::new(writer))
    } else {
        Arc::new(DisabledLogParser)
    }
}

/// `io::Write` view of a parser, for collaborators that stream raw log bytes
///
/// Bytes are held back until a newline arrives so a record (or a UTF-8
/// sequence) split across writes is scanned whole. Whatever is left without
/// a trailing newline is scanned on `flush` and on drop.
pub struct ParserWriter {
    parser: Arc<dyn LogParser>,
    pending: Vec<u8>,
}

impl ParserWriter {
    pub fn new(parser: Arc<dyn LogParser>) -> Self {
        Self {
            parser,
            pending: Vec::new(),
        }
    }

    fn emit(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.parser
            .write_chunk(&String::from_utf8_lossy(bytes))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl Write for ParserWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
            self.emit(&complete)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest)
    }
}

impl Drop for ParserWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Dropped unterminated log tail: {}", e);
        }
    }
}
