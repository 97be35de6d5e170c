//! Data forwarding module
//!
//! Each direction of a relay runs one read pump and one writer. The pump cuts
//! the incoming stream into frames and parks them in the direction's reorder
//! buffer; the writer sends released frames to the peer, one whole frame at a
//! time.

use futures::StreamExt;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::relay::{Lane, Outbound};
use crate::common::Result;
use crate::frame::FrameSplitter;

/// Why a read pump stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// The peer closed its side of the stream
    Eof,
    /// The connection is shutting down
    Cancelled,
}

/// Read frames from `reader` into the lane's reorder buffer
///
/// Stalls while the buffer is full, which stops reading from the socket and
/// pushes back on the sender through TCP flow control.
///
/// # Errors
///
/// Returns an error on a socket fault or when a frame exceeds the splitter's
/// limit. Either aborts the connection.
pub(crate) async fn pump_frames<R>(
    reader: R,
    splitter: FrameSplitter,
    lane: &Lane,
    shutdown: &CancellationToken,
    read_buffer_size: usize,
) -> Result<PumpExit>
where
    R: AsyncRead + Unpin,
{
    let direction = splitter.direction();
    let mut frames = FramedRead::with_capacity(reader, splitter, read_buffer_size.max(1));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(PumpExit::Cancelled),
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                trace!(
                    "[{}] captured frame {} ({} bytes)",
                    direction,
                    frame.sequence(),
                    frame.len()
                );
                if !lane.accept(frame, shutdown).await {
                    return Ok(PumpExit::Cancelled);
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                debug!(
                    "[{}] stream closed after {} frames, {} bytes without a boundary",
                    direction,
                    frames.decoder().next_sequence(),
                    frames.read_buffer().len()
                );
                return Ok(PumpExit::Eof);
            }
        }
    }
}

/// Write released frames from `rx` to `writer`
///
/// Cancellation is only observed between frames, so the peer never sees a
/// truncated frame from this side.
///
/// # Errors
///
/// Returns an error if writing to the peer fails; the connection is then
/// shut down.
pub(crate) async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;

    let result: Result<usize> = loop {
        let outbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(written),
            outbound = rx.recv() => outbound,
        };

        match outbound {
            Some(Outbound::Frame(frame)) => {
                if let Err(e) = writer.write_all(frame.payload()).await {
                    break Err(e.into());
                }
                written += 1;
            }
            Some(Outbound::Flush(ack)) => {
                if let Err(e) = writer.flush().await {
                    break Err(e.into());
                }
                // The releaser may have given up waiting
                let _ = ack.send(());
            }
            None => break Ok(written),
        }
    };

    if result.is_err() {
        shutdown.cancel();
    }
    // Half-close so the peer sees a clean end of stream
    let _ = writer.shutdown().await;
    result
}
