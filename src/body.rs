use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every outbound request: the inbound body, streamed through unchanged.
pub type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn outbound_body<B>(body: B) -> OutboundBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Response body fed chunk by chunk from a bounded channel.
///
/// The relay task holds the sending half; each frame hyper polls out of the
/// receiver frees one slot, which is what lets a slow caller pause the
/// upstream read. An `Err` item aborts the response mid-stream.
pub struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, ProxyError>>,
}

impl ChannelBody {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, ProxyError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// A complete body holding `bytes`, used for locally generated responses.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let (tx, body) = Self::channel(1);
        let bytes = bytes.into();
        if !bytes.is_empty() {
            let _ = tx.try_send(Ok(bytes));
        }
        body
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
