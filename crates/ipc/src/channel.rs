//! Ordered, framed message transport between a parent and one worker

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use workhive_errors::{ContextError, Error, Result};

use crate::transport::{BoxedReader, BoxedWriter};

type Reader = FramedRead<BoxedReader, LengthDelimitedCodec>;
type Writer = FramedWrite<BoxedWriter, LengthDelimitedCodec>;

/// Bidirectional message channel over a duplex stream.
///
/// Each direction sits behind its own lock, so one task may wait on
/// `receive` while another sends. Frames carry a 4-byte big-endian length
/// prefix. Closing the channel, hitting EOF or failing a write terminates
/// both directions; the halves are dropped so the peer observes EOF.
///
/// Cloning is cheap and yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    closed: CancellationToken,
    max_frame_length: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wrap the two halves of a duplex stream
    #[must_use]
    pub fn new(reader: BoxedReader, writer: BoxedWriter, max_frame_length: usize) -> Self {
        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec()
        };

        Self {
            inner: Arc::new(ChannelInner {
                reader: Mutex::new(Some(FramedRead::new(reader, codec()))),
                writer: Mutex::new(Some(FramedWrite::new(writer, codec()))),
                closed: CancellationToken::new(),
                max_frame_length,
            }),
        }
    }

    /// Send one raw frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for frames above the length limit
    /// (the channel stays usable), `ContextError::Closed` if the channel was
    /// closed and `ContextError::StoppedResponding` if the write fails.
    pub async fn send_raw(&self, frame: Bytes) -> Result<()> {
        if frame.len() > self.inner.max_frame_length {
            return Err(Error::serialization(format!(
                "message of {} bytes exceeds the {} byte frame limit",
                frame.len(),
                self.inner.max_frame_length
            )));
        }

        let mut guard = tokio::select! {
            guard = self.inner.writer.lock() => guard,
            () = self.inner.closed.cancelled() => return Err(ContextError::Closed.into()),
        };
        let Some(writer) = guard.as_mut() else {
            return Err(ContextError::Closed.into());
        };

        let outcome = tokio::select! {
            sent = writer.send(frame) => sent,
            () = self.inner.closed.cancelled() => {
                guard.take();
                return Err(ContextError::Closed.into());
            }
        };

        if let Err(err) = outcome {
            guard.take();
            drop(guard);
            self.close();
            return Err(ContextError::stopped_responding(err.to_string()).into());
        }
        Ok(())
    }

    /// Receive one raw frame
    ///
    /// # Errors
    ///
    /// Returns `ContextError::Closed` if the channel was closed locally and
    /// `ContextError::StoppedResponding` on EOF or a read failure.
    pub async fn receive_raw(&self) -> Result<Bytes> {
        let mut guard = tokio::select! {
            guard = self.inner.reader.lock() => guard,
            () = self.inner.closed.cancelled() => return Err(ContextError::Closed.into()),
        };
        let Some(reader) = guard.as_mut() else {
            return Err(ContextError::Closed.into());
        };

        let next = tokio::select! {
            next = reader.next() => next,
            () = self.inner.closed.cancelled() => {
                guard.take();
                return Err(ContextError::Closed.into());
            }
        };

        let failure = match next {
            Some(Ok(frame)) => return Ok(frame.freeze()),
            Some(Err(err)) => err.to_string(),
            None => "the peer closed the connection".to_string(),
        };

        guard.take();
        drop(guard);
        self.close();
        Err(ContextError::stopped_responding(failure).into())
    }

    /// Serialize and send one message
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the value cannot be encoded, or any
    /// error from [`Channel::send_raw`].
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.send_raw(Bytes::from(encoded)).await
    }

    /// Receive and deserialize one message
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the frame does not decode as `T`, or
    /// any error from [`Channel::receive_raw`].
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T> {
        let frame = self.receive_raw().await?;
        serde_json::from_slice(&frame).map_err(Error::from)
    }

    /// Close both directions. Pending and future operations fail with
    /// `ContextError::Closed`; idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has been closed by either side
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

/// Connected pair of channels over an in-memory duplex stream
#[cfg(test)]
pub(crate) fn pair(max_frame_length: usize) -> (Channel, Channel) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        Channel::new(Box::new(left_read), Box::new(left_write), max_frame_length),
        Channel::new(Box::new(right_read), Box::new(right_write), max_frame_length),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn delivers_in_send_order() {
        let (parent, worker) = pair(1024);

        for n in 0..5 {
            parent.send(&json!({ "n": n })).await.unwrap();
        }
        for n in 0..5 {
            let value: Value = worker.receive().await.unwrap();
            assert_eq!(value["n"], n);
        }
    }

    #[tokio::test]
    async fn raw_frames_round_trip_both_ways() {
        let (parent, worker) = pair(1024);

        parent.send_raw(Bytes::from_static(b"key")).await.unwrap();
        assert_eq!(worker.receive_raw().await.unwrap(), Bytes::from_static(b"key"));

        worker.send_raw(Bytes::from_static(b"ack")).await.unwrap();
        assert_eq!(parent.receive_raw().await.unwrap(), Bytes::from_static(b"ack"));
    }

    #[tokio::test]
    async fn close_interrupts_pending_receive() {
        let (parent, _worker) = pair(1024);

        let receiver = parent.clone();
        let pending = tokio::spawn(async move { receiver.receive_raw().await });
        tokio::task::yield_now().await;

        parent.close();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::Closed)));
        assert!(parent.is_closed());
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_stopped_responding() {
        let (parent, worker) = pair(1024);

        worker.close();
        drop(worker);

        let err = parent.receive_raw().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Context(ContextError::StoppedResponding { .. })
        ));
        assert!(parent.is_closed());
    }

    #[tokio::test]
    async fn malformed_message_is_a_serialization_error() {
        let (parent, worker) = pair(1024);

        parent.send_raw(Bytes::from_static(b"not json")).await.unwrap();
        let err = worker.receive::<Value>().await.unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));

        // The channel itself stays usable
        parent.send(&json!(1)).await.unwrap();
        assert_eq!(worker.receive::<Value>().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (parent, worker) = pair(16);

        let err = parent.send_raw(Bytes::from(vec![0u8; 64])).await.unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!parent.is_closed());

        parent.send_raw(Bytes::from_static(b"small")).await.unwrap();
        assert_eq!(worker.receive_raw().await.unwrap(), Bytes::from_static(b"small"));
    }
}
