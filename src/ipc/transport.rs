//! Newline-delimited JSON framing over any async byte stream.
//!
//! Each envelope is serialized to a single line; `serde_json` escapes any
//! embedded newlines inside string values, so the `\n` terminator is an
//! unambiguous frame boundary. Used over the worker subprocess's
//! stdin/stdout in production and over in-memory duplex pipes in tests.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use crate::ipc::Envelope;
use crate::utils::{CompressorError, CompressorResult};

/// Writing half of the message channel.
pub struct FrameSender<W> {
    writer: W,
}

impl<W> std::fmt::Debug for FrameSender<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender").finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serializes and writes one envelope, flushing so the peer sees it
    /// without waiting for more traffic.
    pub async fn send(&mut self, envelope: &Envelope) -> CompressorResult<()> {
        let mut frame = serde_json::to_vec(envelope)?;
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reading half of the message channel.
pub struct FrameReceiver<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Reads the next envelope. `Ok(None)` means the peer closed the
    /// channel; a frame that is not valid JSON for an [`Envelope`] is a
    /// `Serialization` error and does not consume anything beyond its line.
    pub async fn recv(&mut self) -> CompressorResult<Option<Envelope>> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            let frame = self.line.trim();
            if frame.is_empty() {
                continue;
            }
            return serde_json::from_str(frame).map(Some).map_err(|e| {
                CompressorError::serialization(format!("invalid envelope: {e}"))
            });
        }
    }
}
