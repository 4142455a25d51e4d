//! Byte plumbing between the transform's writer task and the consumer.
//!
//! The writer side is an ordinary buffered [`AsyncWrite`]: stock sink
//! adapters turn a bounded chunk channel into a writer, and a `BufWriter`
//! in front batches the serializer's many small token writes into one
//! channel message per flush. A full channel parks the producer, which is
//! the pipeline's backpressure. Failures travel out of band: the writer
//! task leaves its error in a oneshot slot, and [`TransformStream`] yields
//! it after the last delivered chunk, so a consumer never mistakes a dead
//! transform for a short archive.
//!
//! [`AsyncWrite`]: tokio::io::AsyncWrite

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::sink::SinkMapErr;
use futures::{SinkExt, Stream};
use tokio::io::{AsyncRead, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tokio_util::sync::{PollSendError, PollSender};

/// Chunks in flight between producer and consumer. Lets the transform
/// work ahead of a slow consumer without unbounded growth.
const CHANNEL_CAPACITY: usize = 4;

/// Writer-side batching; one channel message per flushed buffer.
const WRITE_BUF_SIZE: usize = 64 * 1024;

type MapErrFn = fn(PollSendError<Bytes>) -> io::Error;

/// The archive serializer's output sink.
pub(crate) type ByteSink =
    BufWriter<SinkWriter<CopyToBytes<SinkMapErr<PollSender<Bytes>, MapErrFn>>>>;

fn consumer_gone(_: PollSendError<Bytes>) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away")
}

pub(crate) fn byte_channel() -> (ByteSink, oneshot::Sender<io::Error>, TransformStream) {
    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (failure_tx, failure_rx) = oneshot::channel();
    let sender = PollSender::new(tx).sink_map_err(consumer_gone as MapErrFn);
    let sink = BufWriter::with_capacity(WRITE_BUF_SIZE, SinkWriter::new(CopyToBytes::new(sender)));
    (
        sink,
        failure_tx,
        TransformStream {
            chunks: rx,
            failure: Some(failure_rx),
        },
    )
}

/// Output of one expand/collapse run: transformed archive bytes in order,
/// then the producer's error if the run died partway.
pub struct TransformStream {
    chunks: mpsc::Receiver<Bytes>,
    failure: Option<oneshot::Receiver<io::Error>>,
}

impl TransformStream {
    /// Adapt the stream to an [`AsyncRead`] for piping into subprocesses
    /// or further transforms.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin + 'static {
        StreamReader::new(self)
    }
}

impl Stream for TransformStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                // every chunk delivered; the producer has either finished
                // cleanly or left its error behind
                let Some(mut failure) = self.failure.take() else {
                    return Poll::Ready(None);
                };
                match Pin::new(&mut failure).poll(cx) {
                    Poll::Ready(Ok(e)) => Poll::Ready(Some(Err(e))),
                    Poll::Ready(Err(_)) => Poll::Ready(None),
                    Poll::Pending => {
                        // the writer task is between dropping its sink and
                        // settling the slot
                        self.failure = Some(failure);
                        Poll::Pending
                    }
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_chunks_then_failure() {
        let (mut sink, failure_tx, mut stream) = byte_channel();
        sink.write_all(b"partial output").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        failure_tx
            .send(io::Error::other("compressor fell over"))
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"partial output");
        let second = stream.next().await.unwrap();
        assert!(second.is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_clean_end_without_failure() {
        let (mut sink, failure_tx, mut stream) = byte_channel();
        sink.write_all(b"done").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        drop(failure_tx);

        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"done");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_writes_batch_into_one_chunk() {
        let (mut sink, _failure_tx, mut stream) = byte_channel();
        // many small writes, as the serializer produces
        for token in [b"entry".as_slice(), b"(", b"name"] {
            sink.write_all(token).await.unwrap();
        }
        sink.flush().await.unwrap();
        drop(sink);

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"entry(name");
    }
}
