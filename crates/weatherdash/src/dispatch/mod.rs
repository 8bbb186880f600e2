//! Resilient streaming dispatcher.
//!
//! A request walks the candidate models in order. Each candidate gets
//! `retries_per_model + 1` attempts with exponential backoff and stepped
//! down effort; a retryable failure on the last attempt moves on to the
//! next candidate. A stream that opens and fails before its first chunk
//! counts as a failed attempt; otherwise it is handed to the caller. Once
//! output is flowing nothing is retried.

pub mod claude;
pub mod policy;
pub mod service;
pub mod sse;
pub mod stream;

pub use claude::{ClaudeClient, ContentBlock, Message, ToolDefinition};
pub use policy::{effort_for_attempt, RetryPolicy};
pub use service::{ChunkStream, ServiceCall, ServiceError, TextService};
pub use stream::{cancel_pair, CancelHandle, CancelSignal, ResponseStream};

use crate::config::{DispatchConfig, EffortConfig};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How hard the model should think on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    High,
    #[default]
    Medium,
    Low,
    Minimal,
}

impl fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffortLevel::High => "high",
            EffortLevel::Medium => "medium",
            EffortLevel::Low => "low",
            EffortLevel::Minimal => "minimal",
        };
        f.write_str(s)
    }
}

/// Picks the effort list for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Chat,
    Insight,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Chat => f.write_str("chat"),
            RequestKind::Insight => f.write_str("insight"),
        }
    }
}

/// One step of the candidate/attempt walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAttempt {
    pub candidate_model: String,
    pub effort: EffortLevel,
    /// 1-based within the candidate
    pub attempt: u32,
}

impl fmt::Display for StreamAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempt {} effort={}",
            self.candidate_model, self.attempt, self.effort
        )
    }
}

/// The model-independent part of a request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    /// Offered to the model. Tool calls it makes are not surfaced, only text.
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<Message>,
}

impl ChatRequest {
    /// Single user turn.
    pub fn prompt(text: &str) -> Self {
        Self {
            messages: vec![Message::user(text)],
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request cancelled")]
    Cancelled,

    #[error("no candidate models configured")]
    NoCandidates,

    #[error("{model} failed: {source}")]
    Terminal { model: String, source: ServiceError },

    #[error("all candidates failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: ServiceError },

    #[error("{model} stream failed: {source}")]
    Stream { model: String, source: ServiceError },
}

impl DispatchError {
    /// HTTP-like status for the caller's boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::Cancelled => 499,
            DispatchError::NoCandidates => 500,
            DispatchError::Terminal { source, .. }
            | DispatchError::Exhausted { source, .. }
            | DispatchError::Stream { source, .. } => match source.status() {
                Some(429) => 429,
                _ => 502,
            },
        }
    }
}

pub struct Dispatcher<S> {
    service: S,
    candidates: Vec<String>,
    effort: EffortConfig,
    policy: RetryPolicy,
}

impl<S: TextService> Dispatcher<S> {
    pub fn new(service: S, config: &DispatchConfig) -> Self {
        Self {
            service,
            candidates: config.candidates.clone(),
            effort: config.effort.clone(),
            policy: RetryPolicy::from_config(config),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    fn efforts(&self, kind: RequestKind) -> &[EffortLevel] {
        match kind {
            RequestKind::Chat => &self.effort.chat,
            RequestKind::Insight => &self.effort.insight,
        }
    }

    /// Open a response stream, falling back across candidates.
    pub async fn stream(
        &self,
        kind: RequestKind,
        request: &ChatRequest,
        cancel: &CancelSignal,
    ) -> Result<ResponseStream, DispatchError> {
        if self.candidates.is_empty() {
            return Err(DispatchError::NoCandidates);
        }

        let levels = self.efforts(kind);
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0u32;
        let mut last_error: Option<ServiceError> = None;

        for (index, model) in self.candidates.iter().enumerate() {
            let last_candidate = index + 1 == self.candidates.len();

            for attempt in 1..=max_attempts {
                if cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled);
                }

                let step = StreamAttempt {
                    candidate_model: model.clone(),
                    effort: effort_for_attempt(levels, attempt),
                    attempt,
                };
                let effort = step.effort;
                let call = ServiceCall {
                    model: model.clone(),
                    effort,
                    system: request.system.clone(),
                    tools: request.tools.clone(),
                    messages: request.messages.clone(),
                };

                log::debug!("[Dispatch] {} request: {}/{}", kind, step, max_attempts);
                attempts += 1;

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    opened = self.service.open(&call) => opened,
                };

                let opened = match opened {
                    Ok(mut chunks) => {
                        let first = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                            first = chunks.next() => first,
                        };
                        // Nothing delivered yet, so an early error is still an attempt failure.
                        match first {
                            Some(Err(e)) => Err(e),
                            first => {
                                let replayed = futures::stream::iter(first).chain(chunks);
                                Ok(Box::pin(replayed) as ChunkStream)
                            }
                        }
                    }
                    Err(e) => Err(e),
                };

                let error = match opened {
                    Ok(chunks) => {
                        log::info!(
                            "[Dispatch] {} streaming from {} after {} attempt(s)",
                            kind,
                            model,
                            attempts
                        );
                        return Ok(ResponseStream::new(
                            chunks,
                            cancel.clone(),
                            model.clone(),
                            effort,
                            attempts,
                        ));
                    }
                    Err(e) => e,
                };

                if !error.is_retryable() {
                    if last_candidate {
                        log::error!("[Dispatch] {} failed terminally: {}", model, error);
                        return Err(DispatchError::Terminal {
                            model: model.clone(),
                            source: error,
                        });
                    }
                    log::warn!(
                        "[Dispatch] {} rejected the request, trying next model: {}",
                        model,
                        error
                    );
                    last_error = Some(error);
                    break;
                }

                log::warn!("[Dispatch] {}/{} failed: {}", step, max_attempts, error);
                last_error = Some(error);

                if attempt < max_attempts {
                    let delay = self.policy.backoff(attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        match last_error {
            Some(source) => {
                log::error!(
                    "[Dispatch] {} request exhausted {} candidates: {}",
                    kind,
                    self.candidates.len(),
                    source
                );
                Err(DispatchError::Exhausted { attempts, source })
            }
            None => Err(DispatchError::NoCandidates),
        }
    }

    /// [`stream`](Self::stream) and collect the whole answer.
    pub async fn generate(
        &self,
        kind: RequestKind,
        request: &ChatRequest,
        cancel: &CancelSignal,
    ) -> Result<String, DispatchError> {
        self.stream(kind, request, cancel).await?.collect_text().await
    }
}
