use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use crate::openai_error_response;
use crate::types::ChatCompletionResponse;

pub const UPSTREAM_READ_FAILED_MESSAGE: &str = "Failed to read response from Groq API";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Completed,
    Failed,
    Abandoned,
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Release::Completed => "completed",
            Release::Failed => "failed",
            Release::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Upstream body stream that releases its source exactly once.
///
/// The inner stream is dropped as soon as it ends, errors, or the wrapper
/// itself is dropped, whichever comes first.
pub struct UpstreamBody {
    inner: Option<BoxStream<'static, Result<Bytes, std::io::Error>>>,
    relayed: u64,
}

impl UpstreamBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
            relayed: 0,
        }
    }

    fn release(&mut self, outcome: Release) {
        if self.inner.take().is_some() {
            tracing::debug!(%outcome, bytes_relayed = self.relayed, "released upstream body");
        }
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamBody")
            .field("open", &self.inner.is_some())
            .field("relayed", &self.relayed)
            .finish()
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.release(Release::Failed);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.release(Release::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        self.release(Release::Abandoned);
    }
}

/// Status and body of an upstream reply, detached from the HTTP client.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, body: UpstreamBody) -> Self {
        Self { status, body }
    }

    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(map_reqwest_stream_error));
        Self::new(status, UpstreamBody::new(body))
    }
}

fn map_reqwest_stream_error(err: reqwest::Error) -> std::io::Error {
    std::io::Error::other(err)
}

/// Picks the relay mode. Upstream errors are always buffered so their JSON
/// body keeps its status and content type, even for stream requests.
pub async fn relay(upstream: UpstreamResponse, stream: bool) -> Response {
    if stream && upstream.status.is_success() {
        relay_streaming(upstream)
    } else {
        relay_buffered(upstream).await
    }
}

/// Reads the whole body, then answers with the upstream status as JSON.
pub async fn relay_buffered(upstream: UpstreamResponse) -> Response {
    let UpstreamResponse { status, body } = upstream;

    let bytes = match read_to_end(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, upstream_status = status.as_u16(), "failed to read upstream body");
            return openai_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                UPSTREAM_READ_FAILED_MESSAGE,
                None,
                None,
            );
        }
    };

    log_usage(status, &bytes);

    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Forwards the body as an event stream while it is still arriving.
///
/// Once headers are out there is no way to report a mid-stream failure
/// beyond cutting the body short; the error goes to the connection layer.
pub fn relay_streaming(upstream: UpstreamResponse) -> Response {
    let UpstreamResponse { status, body } = upstream;

    let mut resp = Response::new(Body::from_stream(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}

async fn read_to_end(mut body: UpstreamBody) -> Result<Bytes, std::io::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}

fn log_usage(status: StatusCode, body: &[u8]) {
    let Ok(completion) = serde_json::from_slice::<ChatCompletionResponse>(body) else {
        return;
    };
    let Some(usage) = completion.usage else {
        return;
    };

    tracing::debug!(
        upstream_status = status.as_u16(),
        model = %completion.model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "upstream token usage"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::stream;
    use http_body_util::BodyExt;

    /// Source stream that counts how many times it has been dropped.
    struct CountingSource<S> {
        inner: S,
        drops: Arc<AtomicUsize>,
    }

    impl<S: Stream + Unpin> Stream for CountingSource<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    impl<S> Drop for CountingSource<S> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted<S>(source: S) -> (UpstreamBody, Arc<AtomicUsize>)
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
    {
        let drops = Arc::new(AtomicUsize::new(0));
        let body = UpstreamBody::new(CountingSource {
            inner: source,
            drops: drops.clone(),
        });
        (body, drops)
    }

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, std::io::Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn streaming_relay_preserves_order_and_sets_event_stream_headers() {
        let (body, drops) = counted(stream::iter(chunks(&[
            "data: a\n\n",
            "data: b\n\n",
            "data: [DONE]\n\n",
        ])));

        let resp = relay(UpstreamResponse::new(StatusCode::OK, body), true).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(resp.headers()[header::CONNECTION], "keep-alive");
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streaming_relay_releases_once_when_caller_disconnects() {
        let source = stream::iter(chunks(&["data: a\n\n"])).chain(stream::pending());
        let (body, drops) = counted(source);

        let resp = relay_streaming(UpstreamResponse::new(StatusCode::OK, body));
        let mut body = resp.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "data: a\n\n");
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(body);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streaming_relay_surfaces_mid_stream_error_after_flushed_bytes() {
        let mut items = chunks(&["data: a\n\n"]);
        items.push(Err(std::io::Error::other("connection reset")));
        items.extend(chunks(&["data: never\n\n"]));
        let (body, drops) = counted(stream::iter(items));

        let resp = relay_streaming(UpstreamResponse::new(StatusCode::OK, body));
        let mut body = resp.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "data: a\n\n");
        assert!(body.frame().await.unwrap().is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(body);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_request_with_upstream_error_is_relayed_as_json() {
        let error = r#"{"error":{"message":"bad model","type":"invalid_request_error"}}"#;
        let (body, drops) = counted(stream::iter(chunks(&[error])));

        let resp = relay(UpstreamResponse::new(StatusCode::BAD_REQUEST, body), true).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert!(resp.headers().get(header::CACHE_CONTROL).is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], error.as_bytes());
    }

    #[tokio::test]
    async fn buffered_relay_is_byte_identical() {
        let (body, drops) = counted(stream::iter(chunks(&[
            "{\"id\":\"x\",",
            "\"object\":\"chat.completion\"}",
        ])));

        let resp = relay(UpstreamResponse::new(StatusCode::OK, body), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"{\"id\":\"x\",\"object\":\"chat.completion\"}");
    }

    #[tokio::test]
    async fn buffered_relay_keeps_upstream_error_status() {
        let (body, _drops) = counted(stream::iter(chunks(&["{\"error\":{}}"])));

        let resp = relay_buffered(UpstreamResponse::new(StatusCode::TOO_MANY_REQUESTS, body)).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"{\"error\":{}}");
    }

    #[tokio::test]
    async fn buffered_relay_read_failure_returns_api_error() {
        let mut items = chunks(&["{\"id\":"]);
        items.push(Err(std::io::Error::other("connection reset")));
        let (body, drops) = counted(stream::iter(items));

        let resp = relay_buffered(UpstreamResponse::new(StatusCode::OK, body)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &bytes[..],
            br#"{"error":{"message":"Failed to read response from Groq API","type":"api_error"}}"#
        );
    }

    #[test]
    fn dropping_unpolled_body_releases_once() {
        let (body, drops) = counted(stream::iter(chunks(&["unused"])));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(body);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
