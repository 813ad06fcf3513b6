//! Length-prefixed JSON framing shared by every Unix socket channel.
//!
//! Format: 4-byte big-endian length prefix followed by the JSON body.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::{Result, VigilError};

/// Largest frame accepted from a peer (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Serialize `message` and write it as one frame.
pub fn write_message<T: Serialize, W: Write>(stream: &mut W, message: &T) -> Result<()> {
    let json = serde_json::to_vec(message)?;
    write_frame(stream, &json)
}

/// Read one frame and deserialize it.
pub fn read_message<T: DeserializeOwned, R: Read>(stream: &mut R) -> Result<T> {
    let body = read_frame(stream)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write raw bytes as one length-prefixed frame.
pub fn write_frame<W: Write>(stream: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| VigilError::Protocol {
        context: "write_frame",
        details: format!("frame of {} bytes does not fit a u32 prefix", body.len()),
    })?;

    stream
        .write_all(&len.to_be_bytes())
        .map_err(|source| transport("write frame length", source))?;
    stream
        .write_all(body)
        .map_err(|source| transport("write frame body", source))?;
    stream
        .flush()
        .map_err(|source| transport("flush frame", source))?;
    Ok(())
}

/// Read one length-prefixed frame as raw bytes.
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|source| transport("read frame length", source))?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(VigilError::Protocol {
            context: "read_frame",
            details: format!("message too large: {len} bytes"),
        });
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .map_err(|source| transport("read frame body", source))?;
    Ok(body)
}

fn transport(context: &'static str, source: std::io::Error) -> VigilError {
    VigilError::Transport { context, source }
}

/// Spawn a thread that decodes frames from `stream` into `tx` until the peer
/// hangs up, the stream errors, or the receiver is dropped.
///
/// Frames that fail to decode are passed to `wrap` as errors so the loop can
/// log them; a transport failure ends the reader and, if given, sends
/// `on_close`.
pub fn spawn_reader<T, M, F>(
    name: &str,
    mut stream: UnixStream,
    tx: Sender<M>,
    wrap: F,
    on_close: Option<M>,
) -> std::io::Result<JoinHandle<()>>
where
    T: DeserializeOwned,
    M: Send + 'static,
    F: Fn(Result<T>) -> M + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        loop {
            let frame = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(reader = %label, error = %err, "reader closing");
                    break;
                }
            };
            let decoded = serde_json::from_slice::<T>(&frame).map_err(VigilError::from);
            if tx.send(wrap(decoded)).is_err() {
                return;
            }
        }
        if let Some(message) = on_close {
            let _ = tx.send(message);
        }
    })
}
