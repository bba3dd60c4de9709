use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use trawl_core::Error;

use crate::types::{DoneEvent, FileMatch, SearchFrame};
use crate::{DONE_EVENT, MATCHES_EVENT, MAX_FRAME_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to decode {event:?} frame: {source}")]
    Json {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed event stream: {0}")]
    Malformed(String),
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// The event name the failing frame was tagged with, if known.
    pub fn event(&self) -> Option<&str> {
        match self {
            DecodeError::Json { event, .. } => Some(event),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::protocol(err.to_string())
    }
}

/// Receives decoded frames from [`read_all`].
///
/// Unknown events are ignored unless the handler overrides [`FrameHandler::on_unknown`].
pub trait FrameHandler {
    type Error: From<DecodeError>;

    fn on_matches(&mut self, matches: Vec<FileMatch>) -> Result<(), Self::Error>;

    fn on_done(&mut self, done: DoneEvent) -> Result<(), Self::Error>;

    fn on_unknown(&mut self, _event: &str, _data: &str) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Pull-based decoder for a worker's event stream.
///
/// Accepts `event:`/`data:` line pairs separated by any number of blank lines, with `\n` or
/// `\r\n` endings. Lines starting with `:` are comments. Once the `done` frame has been returned
/// the underlying reader is not touched again.
pub struct StreamDecoder<R> {
    reader: R,
    line: Vec<u8>,
    max_frame_bytes: usize,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            max_frame_bytes: MAX_FRAME_BYTES,
            done: false,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes.max(1);
        self
    }

    /// Returns the next frame, or `None` after the `done` frame.
    ///
    /// A stream that ends before `done` fails with [`io::ErrorKind::UnexpectedEof`].
    pub async fn next_frame(&mut self) -> Result<Option<SearchFrame>, DecodeError> {
        if self.done {
            return Ok(None);
        }

        let mut event: Option<String> = None;
        loop {
            let Some(line) = self.read_line().await? else {
                let what = match &event {
                    Some(event) => format!("stream ended inside {event:?} frame"),
                    None => "stream ended before done frame".to_owned(),
                };
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, what).into());
            };

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                if let Some(previous) = event {
                    return Err(DecodeError::Malformed(format!(
                        "event {previous:?} has no data line"
                    )));
                }
                event = Some(name.trim().to_owned());
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let Some(event) = event.take() else {
                    return Err(DecodeError::Malformed("data line without event".to_owned()));
                };
                return self.decode_frame(event, data.trim_start()).map(Some);
            }
            return Err(DecodeError::Malformed(format!(
                "unexpected line {:?}",
                truncate(&line, 64)
            )));
        }
    }

    fn decode_frame(&mut self, event: String, data: &str) -> Result<SearchFrame, DecodeError> {
        if event == MATCHES_EVENT {
            return serde_json::from_str::<Vec<FileMatch>>(data)
                .map(SearchFrame::Matches)
                .map_err(|source| DecodeError::Json { event, source });
        }
        if event == DONE_EVENT {
            let done = serde_json::from_str::<DoneEvent>(data)
                .map_err(|source| DecodeError::Json { event, source })?;
            self.done = true;
            return Ok(SearchFrame::Done(done));
        }
        Ok(SearchFrame::Unknown {
            event,
            data: data.to_owned(),
        })
    }

    /// Reads one line without its terminator. `None` at a clean end of stream.
    async fn read_line(&mut self) -> Result<Option<String>, DecodeError> {
        self.line.clear();
        let limit = self.max_frame_bytes as u64;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        } else if read as u64 >= limit {
            return Err(DecodeError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }
        let line = std::str::from_utf8(&self.line)
            .map_err(|err| DecodeError::Malformed(format!("invalid UTF-8: {err}")))?;
        Ok(Some(line.to_owned()))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Decodes frames from `reader` into `handler` until the `done` frame.
///
/// Bytes after `done` are never read.
pub async fn read_all<R, H>(reader: R, handler: &mut H) -> Result<(), H::Error>
where
    R: AsyncBufRead + Unpin,
    H: FrameHandler,
{
    let mut decoder = StreamDecoder::new(reader);
    while let Some(frame) = decoder.next_frame().await? {
        match frame {
            SearchFrame::Matches(matches) => handler.on_matches(matches)?,
            SearchFrame::Done(done) => handler.on_done(done)?,
            SearchFrame::Unknown { event, data } => handler.on_unknown(&event, &data)?,
        }
    }
    Ok(())
}
