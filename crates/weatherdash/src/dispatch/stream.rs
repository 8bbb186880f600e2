//! Cancellation and cancellable response streams.

use super::service::{ChunkStream, ServiceError};
use super::{DispatchError, EffortLevel};
use futures::StreamExt;
use tokio::sync::watch;

/// Create a connected cancellation pair for one request.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Requester side: call [`cancel`](Self::cancel) to abort the request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Dispatcher side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pending forever if the handle was dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A live response. Yields chunks in arrival order until the upstream
/// ends, errors or the request is cancelled; `None` forever afterwards.
pub struct ResponseStream {
    inner: Option<ChunkStream>,
    cancel: CancelSignal,
    model: String,
    effort: EffortLevel,
    attempts: u32,
    cancelled: bool,
}

impl ResponseStream {
    pub(crate) fn new(
        inner: ChunkStream,
        cancel: CancelSignal,
        model: String,
        effort: EffortLevel,
        attempts: u32,
    ) -> Self {
        Self {
            inner: Some(inner),
            cancel,
            model,
            effort,
            attempts,
            cancelled: false,
        }
    }

    /// Model that is serving this response.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn effort(&self) -> EffortLevel {
        self.effort
    }

    /// Total attempts across all candidates, this one included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Next text chunk. A mid-stream error is returned once and ends the stream.
    pub async fn next_chunk(&mut self) -> Option<Result<String, ServiceError>> {
        let inner = self.inner.as_mut()?;

        if self.cancel.is_cancelled() {
            self.stop(true);
            return None;
        }

        let cancel = &self.cancel;
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = inner.next() => Some(item),
        };

        match item {
            None => {
                log::debug!("[Dispatch] {} stream cancelled", self.model);
                self.stop(true);
                None
            }
            Some(None) => {
                self.stop(false);
                None
            }
            Some(Some(Err(e))) => {
                log::warn!("[Dispatch] {} stream failed mid-response: {}", self.model, e);
                self.stop(false);
                Some(Err(e))
            }
            Some(Some(Ok(chunk))) => Some(Ok(chunk)),
        }
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, DispatchError> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            match chunk {
                Ok(chunk) => text.push_str(&chunk),
                Err(source) => {
                    return Err(DispatchError::Stream {
                        model: self.model.clone(),
                        source,
                    })
                }
            }
        }
        if self.cancelled {
            return Err(DispatchError::Cancelled);
        }
        Ok(text)
    }

    /// Drops the upstream stream, which releases its connection.
    fn stop(&mut self, cancelled: bool) {
        self.inner = None;
        self.cancelled = cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(items: Vec<Result<&'static str, ServiceError>>) -> ChunkStream {
        Box::pin(stream::iter(
            items.into_iter().map(|r| r.map(|s| s.to_string())),
        ))
    }

    fn response(inner: ChunkStream, cancel: CancelSignal) -> ResponseStream {
        ResponseStream::new(inner, cancel, "model-a".into(), EffortLevel::Medium, 1)
    }

    #[tokio::test]
    async fn yields_in_order_then_none_forever() {
        let mut rs = response(chunks(vec![Ok("a"), Ok("b")]), CancelSignal::never());
        assert_eq!(rs.next_chunk().await.unwrap().unwrap(), "a");
        assert_eq!(rs.next_chunk().await.unwrap().unwrap(), "b");
        assert!(rs.next_chunk().await.is_none());
        assert!(rs.next_chunk().await.is_none());
        assert!(!rs.was_cancelled());
    }

    #[tokio::test]
    async fn mid_stream_error_surfaces_once() {
        let mut rs = response(
            chunks(vec![
                Ok("partial"),
                Err(ServiceError::Transport("connection reset".into())),
                Ok("never"),
            ]),
            CancelSignal::never(),
        );
        assert!(rs.next_chunk().await.unwrap().is_ok());
        assert!(rs.next_chunk().await.unwrap().is_err());
        assert!(rs.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_pending_read() {
        let (handle, signal) = cancel_pair();
        // Upstream that never produces anything.
        let silent = stream::pending::<Result<String, ServiceError>>();
        let mut rs = response(Box::pin(silent), signal);

        let reader = tokio::spawn(async move {
            let first = rs.next_chunk().await.is_none();
            (first, rs.next_chunk().await.is_none(), rs.was_cancelled())
        });
        tokio::task::yield_now().await;
        handle.cancel();

        assert_eq!(reader.await.unwrap(), (true, true, true));
    }

    #[tokio::test]
    async fn cancelled_collect_is_error() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let rs = response(chunks(vec![Ok("a")]), signal);
        assert!(matches!(rs.collect_text().await, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn collect_joins_chunks() {
        let rs = response(chunks(vec![Ok("It will "), Ok("rain.")]), CancelSignal::never());
        assert_eq!(rs.collect_text().await.unwrap(), "It will rain.");
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        assert!(!signal.is_cancelled());
        let rs = response(chunks(vec![Ok("ok")]), signal);
        assert_eq!(rs.collect_text().await.unwrap(), "ok");
    }
}
