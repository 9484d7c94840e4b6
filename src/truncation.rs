//! Classifies provider responses as truncated or complete (C12).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Missing or unrecognized `finish_reason`; treated as complete.
    Unknown,
}

impl FinishReason {
    fn from_str(value: &str) -> Self {
        match value {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }

    fn is_truncated(self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationVerdict {
    pub finish_reason: FinishReason,
    pub truncated: bool,
    pub total_tokens: u64,
}

/// Stateless classifier: no instance data, just the rules for reading a
/// provider response's shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct TruncationDetector;

impl TruncationDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify `response`. A malformed or missing `choices[0].finish_reason`
    /// is logged and treated as complete, never as an error.
    pub fn detect(&self, response: &Value) -> TruncationVerdict {
        let finish_reason = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(FinishReason::from_str)
            .unwrap_or_else(|| {
                tracing::debug!("response missing choices[0].finish_reason, treating as complete");
                FinishReason::Unknown
            });

        TruncationVerdict {
            finish_reason,
            truncated: finish_reason.is_truncated(),
            total_tokens: Self::extract_tokens(response),
        }
    }

    fn extract_tokens(response: &Value) -> u64 {
        let Some(usage) = response.get("usage") else { return 0 };
        if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
            return total;
        }
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
        prompt + completion
    }
}
