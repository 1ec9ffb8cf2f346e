//! Byte-stream transport.
//!
//! Carries length-delimited JSON frames over any AsyncRead/AsyncWrite pair:
//! child stdin/stdout, unix sockets, in-memory duplex pipes.
//!
//! - Writer task: drains an unbounded queue into a `FramedWrite`, so
//!   `deliver` never blocks and frames leave in call order
//! - Reader task: started by `attach`, feeds every frame to the bridge. A
//!   frame that is not JSON is skipped; a broken length prefix ends the stream
//!
//! A stream is point-to-point: `target_origin` is not checked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{Inbound, Transport, TransportError};
use crate::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, frame_delimiter};
use crate::protocol::Message;

pub struct StreamTransport<R> {
    outbound: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<FramedRead<R, LengthDelimitedCodec>>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl<R> StreamTransport<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Wrap a reader/writer pair and start the writer task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let mut framed = FramedWrite::new(writer, FrameCodec::<Message>::new());
        let writer_closed = Arc::clone(&closed);
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = outbound_rx.recv() => {
                        let Some(message) = next else { break };
                        let kind = message.kind();
                        if let Err(e) = framed.send(message).await {
                            tracing::warn!(error = %e, kind, "Stream write failed");
                            break;
                        }
                    }
                }
            }
            writer_closed.store(true, Ordering::Release);
            tracing::trace!("Stream writer exiting");
        });

        Self {
            outbound,
            reader: Mutex::new(Some(FramedRead::new(
                reader,
                frame_delimiter(DEFAULT_MAX_FRAME_LENGTH),
            ))),
            closed,
            cancel,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }
}

impl<R> Transport for StreamTransport<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    type Endpoint = ();

    fn resolve_counterpart(&self) -> Option<()> {
        (!self.is_closed()).then_some(())
    }

    fn deliver(&self, _: &(), message: &Message, _target_origin: &str) -> Result<(), TransportError> {
        self.outbound
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn attach(&self, inbound: Inbound) {
        let Some(mut reader) = self.reader.lock().ok().and_then(|mut r| r.take()) else {
            tracing::warn!("Stream transport already attached");
            return;
        };
        let cancel = self.cancel.clone();
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next() => match frame {
                        Some(Ok(frame)) => {
                            if !inbound.dispatch_slice(&frame) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Stream read failed");
                            closed.store(true, Ordering::Release);
                            break;
                        }
                        None => {
                            tracing::debug!("Stream closed by counterpart");
                            closed.store(true, Ordering::Release);
                            break;
                        }
                    },
                }
            }
            tracing::trace!("Stream reader exiting");
        });
    }

    fn detach(&self) {
        self.cancel.cancel();
    }
}

impl<R> Drop for StreamTransport<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::error::BridgeError;
    use crate::protocol::RequestMessage;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, ReadHalf, duplex, split};
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::Encoder;

    type DuplexTransport = StreamTransport<ReadHalf<tokio::io::DuplexStream>>;

    fn connected_pair() -> (DuplexTransport, DuplexTransport) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);
        (
            StreamTransport::new(a_read, a_write),
            StreamTransport::new(b_read, b_write),
        )
    }

    #[tokio::test]
    async fn request_round_trip_over_duplex_stream() {
        let (host_side, child_side) = connected_pair();
        let host = Bridge::new(host_side, BridgeConfig::new().with_timeout(Duration::from_secs(5)));
        let child = Bridge::new(child_side, BridgeConfig::new());

        let _sub = child.on("math:add", |payload| async move {
            let sum: i64 = payload
                .as_array()
                .map(|xs| xs.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            Ok(json!(sum))
        });

        let result = host.request("math:add", json!([2, 3, 4]), None).await.unwrap();
        assert_eq!(result, json!(9));
    }

    #[tokio::test]
    async fn closed_stream_makes_counterpart_unavailable() {
        let (host_side, child_side) = connected_pair();
        let host = Bridge::new(host_side, BridgeConfig::new());
        drop(child_side);

        // The reader observes EOF and marks the stream closed.
        for _ in 0..50 {
            if host.transport().is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(host.transport().is_closed());
        assert_eq!(
            host.request("a:b", Value::Null, None).await.unwrap_err(),
            BridgeError::Unavailable
        );
    }

    #[tokio::test]
    async fn non_json_frame_is_skipped() {
        let (ours, mut theirs) = duplex(1024);
        let (read, write) = split(ours);
        let child = Bridge::new(StreamTransport::new(read, write), BridgeConfig::new());
        let _sub = child.on("x:y", |payload| async move { Ok(payload) });

        theirs
            .write_all(&[0, 0, 0, 3, b'x', b'y', b'z'])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!child.transport().is_closed());

        // A well-formed request after the garbage frame is still answered.
        let request = Message::from(RequestMessage::new(
            "msg_1_1",
            "x:y",
            json!("after garbage"),
        ));
        let mut encoded = BytesMut::new();
        FrameCodec::<Message>::new().encode(request, &mut encoded).unwrap();
        theirs.write_all(&encoded).await.unwrap();

        let mut responses = FramedRead::new(theirs, FrameCodec::<Value>::new());
        let response = tokio::time::timeout(Duration::from_secs(5), responses.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response["id"], json!("msg_1_1"));
        assert_eq!(response["success"], json!(true));
        assert_eq!(response["data"], json!("after garbage"));
        assert!(!child.transport().is_closed());
    }
}
