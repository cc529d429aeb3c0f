//! Line-framed queues over byte streams
//!
//! Bridges a rank's in-memory queue onto a pipe, so the same worker unit
//! runs as a task or behind a child process's stdin/stdout.

use lockstep_common::error::Result;
use lockstep_proto::{decode_frame, encode_frame};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

/// Decode one frame per line from `reader` into `tx` until EOF
///
/// Lines that do not decode are logged and skipped. Returns early when the
/// receiving side is gone.
pub async fn read_frames<T, R>(reader: R, tx: UnboundedSender<T>) -> Result<()>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame::<T>(&line) {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, line = %truncate(&line), "Skipping undecodable frame"),
        }
    }

    trace!("Frame reader finished");
    Ok(())
}

/// Encode everything received on `rx` onto `writer`, one line per frame,
/// until the sending side closes
pub async fn write_frames<T, W>(mut writer: W, mut rx: UnboundedReceiver<T>) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let line = encode_frame(&frame)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }

    trace!("Frame writer finished");
    Ok(())
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
