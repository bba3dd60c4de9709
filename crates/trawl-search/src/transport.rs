use std::io;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use trawl_core::{Error, RepoUnavailableReason};
use trawl_endpoint::Endpoint;
use trawl_proto::{DecodeError, DoneEvent, FileMatch, SearchFrame, SearchRequest, StreamDecoder};

/// Sends one search request to one searcher and streams back its frames.
///
/// Implementations deliver every `matches` frame to `on_matches` as it arrives and return the
/// terminal `done` frame. Interpreting the done frame is left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn search(
        &self,
        endpoint: &Endpoint,
        request: &SearchRequest,
        on_matches: &(dyn Fn(Vec<FileMatch>) + Send + Sync),
    ) -> Result<DoneEvent, Error>;
}

/// [`Transport`] over HTTP: the request is POSTed as JSON and the response body is read as an
/// event stream.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn search(
        &self,
        endpoint: &Endpoint,
        request: &SearchRequest,
        on_matches: &(dyn Fn(Vec<FileMatch>) + Send + Sync),
    ) -> Result<DoneEvent, Error> {
        let response = self
            .client
            .post(endpoint.as_str())
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body.trim()));
        }

        let body = response.bytes_stream().map_err(io::Error::other);
        let mut decoder = StreamDecoder::new(BufReader::new(StreamReader::new(body)));
        while let Some(frame) = decoder.next_frame().await.map_err(map_decode_error)? {
            match frame {
                SearchFrame::Matches(matches) => on_matches(matches),
                SearchFrame::Done(done) => return Ok(done),
                SearchFrame::Unknown { event, .. } => {
                    tracing::debug!(
                        target: "trawl.search",
                        %endpoint,
                        event = %event,
                        "ignoring unknown event"
                    );
                }
            }
        }
        Err(Error::protocol("event stream ended without a done frame"))
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Error::transient(err.to_string())
    } else {
        Error::permanent(err.to_string())
    }
}

fn map_status(status: reqwest::StatusCode, body: &str) -> Error {
    let message = if body.is_empty() {
        format!("searcher returned {status}")
    } else {
        format!("searcher returned {status}: {body}")
    };
    match status {
        reqwest::StatusCode::SERVICE_UNAVAILABLE => Error::transient(message),
        reqwest::StatusCode::NOT_FOUND => {
            Error::repo_unavailable(RepoUnavailableReason::Missing, message)
        }
        _ => Error::permanent(message),
    }
}

/// A body that breaks off mid-stream is a transport failure worth retrying; anything the decoder
/// rejects is a protocol error.
fn map_decode_error(err: DecodeError) -> Error {
    match err {
        DecodeError::Io(err) => Error::transient(format!("reading search results: {err}")),
        other => other.into(),
    }
}
