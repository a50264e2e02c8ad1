//! Stream Bridge
//!
//! Turns the push-style delivery of a streaming transport into a pull-style
//! chunk sequence. The producer runs as its own task and writes normalized
//! [`ChunkEnvelope`]s into a bounded FIFO queue through an [`EventSink`]; the
//! consumer drains it through a [`ChunkStream`].
//!
//! The producer reports its outcome exactly once on a oneshot channel. A
//! producer that panics or is aborted drops that channel unsent, which the
//! consumer surfaces as a stream error. Chunks already queued are always
//! delivered before any error.

use crate::api::completion::CompletionResponse;
use crate::api::normalize::StreamNormalizer;
use crate::api::streaming::{ChunkEnvelope, StreamAccumulator, StreamChunk};
use crate::error::{LlmaoError, Result};
use crate::ClientOptions;
use futures::Stream;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Producer side of a stream bridge
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ChunkEnvelope>,
    normalizer: StreamNormalizer,
    delivered: usize,
}

impl EventSink {
    fn new(tx: mpsc::Sender<ChunkEnvelope>, normalizer: StreamNormalizer) -> Self {
        Self {
            tx,
            normalizer,
            delivered: 0,
        }
    }

    /// Normalize one raw vendor event and enqueue the resulting envelopes.
    ///
    /// Waits while the queue is full. Returns [`LlmaoError::Cancelled`] once
    /// the consumer has gone away.
    pub async fn push(&mut self, event: &Value) -> Result<()> {
        for envelope in self.normalizer.normalize(event)? {
            trace!(index = envelope.index, seq = self.delivered, "enqueue chunk");
            self.tx
                .send(envelope)
                .await
                .map_err(|_| LlmaoError::Cancelled)?;
            self.delivered += 1;
        }
        Ok(())
    }

    /// Whether the consumer has dropped its end of the queue
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Envelopes enqueued so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

enum Phase {
    /// Producer may still be running
    Streaming,
    /// Producer finished; remaining queued chunks go out before the outcome
    Draining(Option<LlmaoError>),
    Finished,
}

/// Consumer side of a stream bridge: a lazy, finite, single-pass sequence of
/// canonical chunks.
///
/// Dropping the stream cancels the producer and aborts its task.
pub struct ChunkStream {
    rx: mpsc::Receiver<ChunkEnvelope>,
    done: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    poll_interval: Duration,
    queue_closed: bool,
    phase: Phase,
}

impl ChunkStream {
    /// Start a producer and return the consumer end.
    ///
    /// `produce` receives the sink and a cancellation token and is run on its
    /// own task. It also races against the token, so a producer that ignores
    /// cancellation is still stopped at its next await point.
    pub fn spawn<F, Fut>(options: &ClientOptions, normalizer: StreamNormalizer, produce: F) -> Self
    where
        F: FnOnce(EventSink, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (done_tx, done) = oneshot::channel();
        let cancel = CancellationToken::new();

        let work = produce(EventSink::new(tx, normalizer), cancel.clone());
        let token = cancel.clone();
        let producer = tokio::spawn(async move {
            let outcome = tokio::select! {
                result = work => result,
                _ = token.cancelled() => Err(LlmaoError::Cancelled),
            };

            match &outcome {
                Ok(()) => debug!("stream producer finished"),
                Err(LlmaoError::Cancelled) => debug!("stream producer cancelled"),
                Err(err) => warn!(error = %err, "stream producer failed"),
            }

            // Nobody left to tell if the consumer is gone
            let _ = done_tx.send(outcome);
        });

        Self {
            rx,
            done,
            cancel,
            producer: Some(producer),
            poll_interval: options.poll_interval,
            queue_closed: false,
            phase: Phase::Streaming,
        }
    }

    /// Pull the next chunk.
    ///
    /// Returns `None` once the producer has completed and the queue is empty.
    /// A producer failure is returned once, after every chunk queued before
    /// it; the sequence ends after that.
    pub async fn next(&mut self) -> Option<Result<StreamChunk>> {
        loop {
            match &mut self.phase {
                Phase::Finished => return None,
                Phase::Draining(error) => {
                    if let Ok(envelope) = self.rx.try_recv() {
                        return Some(Ok(envelope.into_chunk()));
                    }
                    let error = error.take();
                    self.phase = Phase::Finished;
                    return error.map(Err);
                }
                Phase::Streaming => {}
            }

            if !self.queue_closed {
                match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                    Ok(Some(envelope)) => return Some(Ok(envelope.into_chunk())),
                    Ok(None) => self.queue_closed = true,
                    Err(_elapsed) => {}
                }
            }

            if let Some(outcome) = self.completion().await {
                self.phase = Phase::Draining(outcome.err());
            }
        }
    }

    /// Check the completion signal. `None` means the producer is still running.
    async fn completion(&mut self) -> Option<Result<()>> {
        let lost = || LlmaoError::Stream("producer exited without reporting an outcome".to_string());

        if self.queue_closed {
            // Every sender is gone, so the outcome is sent or dropped promptly
            return Some((&mut self.done).await.unwrap_or_else(|_| Err(lost())));
        }

        match self.done.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(lost())),
        }
    }

    /// Whether the sequence has been exhausted
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamChunk>> + Send {
        let mut chunks = self;
        async_stream::stream! {
            while let Some(item) = chunks.next().await {
                yield item;
            }
        }
    }

    /// Consume every chunk and fold them into one response
    pub async fn collect(mut self) -> Result<CompletionResponse> {
        let mut acc = StreamAccumulator::new();
        while let Some(chunk) = self.next().await {
            acc.process_chunk(&chunk?);
        }
        Ok(acc.into_response())
    }

    /// Stop the producer and wait for its task to exit
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            if let Err(err) = producer.await {
                if err.is_panic() {
                    warn!("stream producer panicked during close");
                }
            }
        }
        self.phase = Phase::Finished;
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("poll_interval", &self.poll_interval)
            .field("queue_closed", &self.queue_closed)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn options() -> ClientOptions {
        ClientOptions {
            poll_interval: Duration::from_millis(5),
            queue_capacity: 4,
        }
    }

    fn normalizer() -> StreamNormalizer {
        StreamNormalizer::new(Protocol::OpenAi, "m1")
    }

    fn event(content: &str) -> Value {
        json!({
            "id": "s1",
            "created": 1,
            "model": "m1",
            "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
        })
    }

    async fn drain(stream: &mut ChunkStream) -> (Vec<String>, Vec<LlmaoError>) {
        let mut contents = Vec::new();
        let mut errors = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => contents.push(chunk.content().unwrap_or_default().to_string()),
                Err(err) => errors.push(err),
            }
        }
        (contents, errors)
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn wait_for(flag: &AtomicBool) -> bool {
        for _ in 0..200 {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_despite_producer_delay() {
        let mut stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            for content in ["c1", "c2", "c3"] {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sink.push(&event(content)).await?;
            }
            Ok(())
        });

        let (contents, errors) = drain(&mut stream).await;
        assert_eq!(contents, vec!["c1", "c2", "c3"]);
        assert!(errors.is_empty());
        assert!(stream.is_finished());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_surfaces_after_queued_chunks() {
        let mut stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            sink.push(&event("c1")).await?;
            sink.push(&event("c2")).await?;
            Err(LlmaoError::transport("connection reset"))
        });

        // Give the producer time to finish before the first pull
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (contents, errors) = drain(&mut stream).await;
        assert_eq!(contents, vec!["c1", "c2"]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_transport());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_more_chunks_than_queue_capacity() {
        let mut stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            for i in 0..50 {
                sink.push(&event(&format!("c{i}"))).await?;
            }
            Ok(())
        });

        let (contents, errors) = drain(&mut stream).await;
        let expected: Vec<String> = (0..50).map(|i| format!("c{i}")).collect();
        assert_eq!(contents, expected);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_producer_is_a_stream_error() {
        let mut stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            sink.push(&event("c1")).await?;
            let fail = true;
            if fail {
                panic!("producer blew up");
            }
            Ok(())
        });

        let (contents, errors) = drain(&mut stream).await;
        assert_eq!(contents, vec!["c1"]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LlmaoError::Stream(_)));
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let stopped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(Arc::clone(&stopped));

        let mut stream = ChunkStream::spawn(&options(), normalizer(), move |mut sink, cancel| async move {
            let _guard = guard;
            while !cancel.is_cancelled() {
                sink.push(&event("tick")).await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        });

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content(), Some("tick"));
        drop(stream);

        assert!(wait_for(&stopped).await, "producer kept running after drop");
    }

    #[tokio::test]
    async fn test_close_joins_producer() {
        let stopped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(Arc::clone(&stopped));

        let mut stream = ChunkStream::spawn(&options(), normalizer(), move |_sink, _cancel| async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        stream.close().await;
        assert!(stopped.load(Ordering::SeqCst));
        assert!(stream.is_finished());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_consumer_gone_reports_cancelled() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = EventSink::new(tx, normalizer());
        drop(rx);

        assert!(sink.is_closed());
        let err = tokio_test::assert_err!(sink.push(&event("late")).await);
        assert!(matches!(err, LlmaoError::Cancelled));
        assert_eq!(sink.delivered(), 0);
    }

    #[tokio::test]
    async fn test_into_stream_and_collect() {
        let stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            sink.push(&event("Hello")).await?;
            sink.push(&event(" World")).await?;
            Ok(())
        });
        let items: Vec<Result<StreamChunk>> = stream.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap().object, "chat.completion.chunk");

        let stream = ChunkStream::spawn(&options(), normalizer(), |mut sink, _cancel| async move {
            sink.push(&event("Hello")).await?;
            sink.push(&json!({
                "id": "s1", "created": 1, "model": "m1",
                "choices": [{ "index": 0, "delta": { "content": " World" }, "finish_reason": "stop" }]
            }))
            .await?;
            Ok(())
        });
        let response = stream.collect().await.unwrap();
        assert_eq!(response.content(), Some("Hello World".to_string()));
        assert_eq!(response.finish_reason(), Some("stop"));
    }
}
