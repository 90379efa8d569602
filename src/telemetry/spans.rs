//! Request span helpers.

use tracing::{info_span, Span};

use crate::api::protocol::Usage;

/// Extension trait for filling in span fields after the fact.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    fn record_usage(&self, usage: &Usage);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }

    fn record_usage(&self, usage: &Usage) {
        self.record("prompt_tokens", usage.prompt_tokens);
        self.record("completion_tokens", usage.completion_tokens);
    }
}

/// Factory for request spans.
pub struct RequestSpan;

impl RequestSpan {
    /// Span for one endpoint call.
    ///
    /// `request_id`, token counts, `status`, `error.message` and
    /// `latency_ms` start empty and are recorded as they become known.
    pub fn new(endpoint: &'static str, model_id: &str) -> Span {
        info_span!(
            "request",
            endpoint,
            model_id = %model_id,
            request_id = tracing::field::Empty,
            prompt_tokens = tracing::field::Empty,
            completion_tokens = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
