use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::types::{DoneEvent, FileMatch};
use crate::{DONE_EVENT, MATCHES_EVENT};

/// Encodes one frame as `event: <name>\n\ndata: <json>\n\n`.
pub fn encode_frame<T: Serialize + ?Sized>(
    event: &str,
    payload: &T,
) -> Result<Vec<u8>, serde_json::Error> {
    let data = serde_json::to_vec(payload)?;
    let mut out = Vec::with_capacity(event.len() + data.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\n\ndata: ");
    out.extend_from_slice(&data);
    out.extend_from_slice(b"\n\n");
    Ok(out)
}

/// Writes frames to a worker response body.
pub struct EventWriter<W> {
    writer: W,
    done: bool,
}

impl<W: AsyncWrite + Unpin> EventWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            done: false,
        }
    }

    pub async fn write_event<T: Serialize + ?Sized>(
        &mut self,
        event: &str,
        payload: &T,
    ) -> std::io::Result<()> {
        if self.done {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "event stream already finished",
            ));
        }
        let frame = encode_frame(event, payload)?;
        self.writer.write_all(&frame).await
    }

    pub async fn write_matches(&mut self, matches: &[FileMatch]) -> std::io::Result<()> {
        self.write_event(MATCHES_EVENT, matches).await
    }

    /// Writes the terminal frame and flushes. Later writes fail.
    pub async fn write_done(&mut self, done: &DoneEvent) -> std::io::Result<()> {
        self.write_event(DONE_EVENT, done).await?;
        self.done = true;
        self.writer.flush().await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
