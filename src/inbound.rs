//! Hyper side of an exchange: a [`ResponseSink`] feeding the response that
//! the server's service future hands back to hyper.
//!
//! The head travels over a oneshot channel and is committed on the first body
//! write (or at completion for empty bodies). The body travels over a bounded
//! channel whose receiver lives with the service future from the start, so a
//! peer that disconnects before the head is sent still closes the sink.
//!
//! hyper drops a response body as soon as the bytes its `Content-Length`
//! declares have been written, so the sink tracks that length and stops
//! treating a closed receiver as peer loss once the message is complete.

use crate::body::ChannelBody;
use crate::completion::Outcome;
use crate::error::ProxyError;
use crate::relay::ResponseSink;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use hyper::http::response::Parts;
use hyper::{Response, StatusCode};
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

pub type ProxyResponse = Response<ChannelBody>;

/// Builds a connected sink/response pair. `buffer_chunks` bounds how many
/// chunks may sit between the relay and hyper's writer.
pub fn response_channel(buffer_chunks: usize) -> (HyperSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body) = ChannelBody::channel(buffer_chunks);
    let sink = HyperSink {
        head: Some(head_tx),
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: Some(body_tx),
        declared_len: None,
        written: 0,
        message_end: Arc::new(AtomicBool::new(false)),
    };
    (sink, PendingResponse { head: head_rx, body })
}

/// Locally generated plain-text response.
pub fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let mut response = Response::new(ChannelBody::full(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// The service future's half: resolves once the relay commits a head.
pub struct PendingResponse {
    head: oneshot::Receiver<Parts>,
    body: ChannelBody,
}

impl PendingResponse {
    pub async fn into_response(self) -> ProxyResponse {
        match self.head.await {
            Ok(parts) => Response::from_parts(parts, self.body),
            Err(_) => error_response(StatusCode::BAD_GATEWAY, "Proxy Error: relay ended without a response"),
        }
    }
}

pub struct HyperSink {
    head: Option<oneshot::Sender<Parts>>,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<mpsc::Sender<Result<Bytes, ProxyError>>>,
    declared_len: Option<u64>,
    written: u64,
    /// Set once every declared body byte has been handed to hyper.
    message_end: Arc<AtomicBool>,
}

impl HyperSink {
    pub fn is_committed(&self) -> bool {
        self.head.is_none()
    }

    fn commit(&mut self) -> Result<(), ProxyError> {
        let Some(head_tx) = self.head.take() else {
            return Ok(());
        };
        let (mut parts, ()) = Response::new(()).into_parts();
        parts.status = self.status;
        parts.headers = std::mem::take(&mut self.headers);
        head_tx
            .send(parts)
            .map_err(|_| ProxyError::Cancelled("client disconnected".to_string()))
    }

    /// Replaces a head that was never sent with a locally generated one.
    fn commit_local(&mut self, status: StatusCode, message: String) {
        self.status = status;
        self.headers.clear();
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if self.commit().is_ok() {
            if let Some(body) = self.body.take() {
                let _ = body.try_send(Ok(Bytes::from(message)));
            }
        }
    }

    /// Ends the body with an error so hyper aborts the response instead of terminating it cleanly.
    fn abort_body(&mut self, error: ProxyError) {
        let Some(body) = self.body.take() else { return };
        if let Err(TrySendError::Full(item)) = body.try_send(Err(error)) {
            tokio::spawn(async move {
                let _ = body.send(item).await;
            });
        }
    }

    fn sender(&self) -> Result<&mpsc::Sender<Result<Bytes, ProxyError>>, ProxyError> {
        self.body
            .as_ref()
            .ok_or_else(|| ProxyError::Cancelled("response already finished".to_string()))
    }
}

#[async_trait]
impl ResponseSink for HyperSink {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if name == CONTENT_LENGTH {
            self.declared_len = value.to_str().ok().and_then(|v| v.trim().parse().ok());
        }
        self.headers.append(name, value);
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        self.commit()?;
        self.written += chunk.len() as u64;
        if self.declared_len.is_some_and(|len| self.written >= len) {
            self.message_end.store(true, Ordering::Release);
        }
        self.sender()?
            .send(Ok(chunk))
            .await
            .map_err(|_| ProxyError::Cancelled("client disconnected".to_string()))
    }

    /// Waits until hyper has taken enough chunks off the channel to accept another one.
    async fn flush(&mut self) -> Result<(), ProxyError> {
        self.commit()?;
        if self.message_end.load(Ordering::Acquire) {
            return Ok(());
        }
        self.sender()?
            .reserve()
            .await
            .map(drop)
            .map_err(|_| ProxyError::Cancelled("client disconnected".to_string()))
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let Some(body) = self.body.clone() else {
            return Box::pin(futures::future::pending());
        };
        let message_end = self.message_end.clone();
        Box::pin(async move {
            body.closed().await;
            if message_end.load(Ordering::Acquire) {
                futures::future::pending::<()>().await;
            }
        })
    }

    async fn complete(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success { .. } => {
                if let Err(e) = self.commit() {
                    debug!("Response head dropped: {}", e);
                }
                self.body = None;
            }
            Outcome::Failure(e) if !self.is_committed() => {
                self.commit_local(e.status_code(), format!("Proxy Error: {}", e));
            }
            Outcome::Failure(e) => self.abort_body(ProxyError::UpstreamProtocol(e.to_string())),
            Outcome::Cancelled(reason) if !self.is_committed() => {
                self.commit_local(StatusCode::SERVICE_UNAVAILABLE, format!("Request cancelled: {}", reason));
            }
            Outcome::Cancelled(reason) => self.abort_body(ProxyError::Cancelled(reason.clone())),
        }
    }
}
