use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use futures::stream;
use pin_project_lite::pin_project;
use super::traits::ChunkProgress;

pin_project! {
    /// Reports the cumulative number of bytes yielded by `inner`.
    pub struct ChunkProgressStream<S> {
        #[pin]
        inner: S,
        loaded: u64,
        on_progress: ChunkProgress,
    }
}

impl<S> ChunkProgressStream<S> {
    pub fn new(inner: S, on_progress: ChunkProgress) -> Self {
        Self {
            inner,
            loaded: 0,
            on_progress,
        }
    }
}

impl<S> Stream for ChunkProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(piece))) => {
                if !piece.is_empty() {
                    *this.loaded += piece.len() as u64;
                    (this.on_progress)(*this.loaded);
                }
                Poll::Ready(Some(Ok(piece)))
            }
            other => other,
        }
    }
}

/// Splits a chunk into zero-copy pieces of at most `piece_size` bytes.
pub fn piece_stream(chunk: Bytes, piece_size: usize) -> impl Stream<Item = std::io::Result<Bytes>> {
    let piece_size = piece_size.max(1);
    let pieces: Vec<_> = (0..chunk.len())
        .step_by(piece_size)
        .map(|start| Ok(chunk.slice(start..(start + piece_size).min(chunk.len()))))
        .collect();

    stream::iter(pieces)
}
