//! Worker-subprocess side of the message channel.
//!
//! The worker signals `ready`, then serially decodes requests, runs the
//! compression engine, and answers with `success` or `error` envelopes. A
//! malformed inbound frame is answered with an id-less `error` envelope
//! rather than taking the process down.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::ipc::{Envelope, FrameReceiver, FrameSender};
use crate::utils::{CompressorError, CompressorResult};

/// Runs the worker loop over the given channel endpoints until the
/// coordinator closes its end.
pub async fn serve<R, W>(reader: R, writer: W, engine: Engine) -> CompressorResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut receiver = FrameReceiver::new(reader);
    let mut sender = FrameSender::new(writer);

    sender.send(&Envelope::Ready).await?;
    info!("worker ready (tools: {:?})", engine.tool_names());

    loop {
        match receiver.recv().await {
            Ok(Some(Envelope::Request { id, job })) => {
                debug!(
                    "processing request {} ({}, {} bytes)",
                    id,
                    job.filename,
                    job.image.len()
                );
                let reply = match engine.run(&job) {
                    Ok(outcome) => Envelope::Success { id, outcome },
                    Err(e) => Envelope::Error {
                        id: Some(id),
                        message: e.to_string(),
                    },
                };
                sender.send(&reply).await?;
            }
            Ok(Some(other)) => {
                warn!("ignoring unexpected {} envelope", other.kind());
            }
            Ok(None) => {
                info!("channel closed, worker exiting");
                return Ok(());
            }
            Err(CompressorError::Serialization(msg)) => {
                warn!("malformed request frame: {}", msg);
                sender
                    .send(&Envelope::Error {
                        id: None,
                        message: format!("malformed request: {msg}"),
                    })
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Entry point for `--worker` mode: serve the channel on stdin/stdout with
/// the compiled-in toolset.
pub async fn run_stdio() -> CompressorResult<()> {
    serve(tokio::io::stdin(), tokio::io::stdout(), Engine::with_default_tools()).await
}
