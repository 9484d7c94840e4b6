//! Multi-turn continuation for responses truncated by the provider (C9).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::config::ContinuationConfig;
use crate::models::generate_session_id;
use crate::truncation::TruncationDetector;

/// Calls back out to whatever transport actually talks to the provider.
#[async_trait]
pub trait ProviderCallable: Send + Sync {
    async fn call(&self, messages: &[Value]) -> Result<Value, String>;
}

#[derive(Debug, Clone)]
pub struct ContinuationSession {
    id: String,
    attempt_count: u32,
    cumulative_tokens: u64,
    chunks: Vec<String>,
    max_attempts: u32,
    max_total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxAttemptsReached,
    TokenBudgetExceeded,
    NoProgress,
    EmptyResponse,
}

impl ContinuationSession {
    fn new(config: &ContinuationConfig) -> Self {
        Self {
            id: generate_session_id("cont"),
            attempt_count: 0,
            cumulative_tokens: 0,
            chunks: Vec::new(),
            max_attempts: config.max_attempts,
            max_total_tokens: config.max_total_tokens,
        }
    }

    fn last_chunk(&self) -> &str {
        self.chunks.last().map(String::as_str).unwrap_or("")
    }

    /// Record the provider's initial response. Does not count against
    /// `maxAttempts` — only continuation calls do.
    fn add_initial(&mut self, chunk: String, tokens: u64) {
        self.cumulative_tokens += tokens;
        self.chunks.push(chunk);
    }

    /// Record a continuation attempt's chunk.
    fn add_chunk(&mut self, chunk: String, tokens: u64) {
        self.cumulative_tokens += tokens;
        self.attempt_count += 1;
        self.chunks.push(chunk);
    }

    /// Decide whether `new_chunk` warrants another continuation attempt.
    /// Evaluated against state *before* the chunk is added.
    pub fn should_continue(&self, new_chunk: &str, new_tokens: u64) -> Result<(), StopReason> {
        if self.attempt_count >= self.max_attempts {
            return Err(StopReason::MaxAttemptsReached);
        }
        if self.cumulative_tokens + new_tokens >= self.max_total_tokens {
            return Err(StopReason::TokenBudgetExceeded);
        }
        let trimmed = new_chunk.trim();
        if trimmed == self.last_chunk().trim() {
            return Err(StopReason::NoProgress);
        }
        if trimmed.is_empty() {
            return Err(StopReason::EmptyResponse);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ContinuationOutcome {
    pub complete_response: String,
    pub is_complete: bool,
    pub attempts_made: u32,
    pub total_tokens_used: u64,
    pub was_truncated: bool,
    pub session_id: String,
}

/// Owns in-flight continuation sessions, keyed by session id.
pub struct ContinuationManager {
    config: ContinuationConfig,
    detector: TruncationDetector,
    sessions: Mutex<HashMap<String, ContinuationSession>>,
}

impl ContinuationManager {
    pub fn new(config: ContinuationConfig) -> Self {
        Self { config, detector: TruncationDetector::new(), sessions: Mutex::new(HashMap::new()) }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().expect("sessions mutex poisoned").len()
    }

    pub async fn run(
        &self,
        original_messages: Vec<Value>,
        initial_response: Value,
        provider: &dyn ProviderCallable,
    ) -> ContinuationOutcome {
        let mut session = ContinuationSession::new(&self.config);
        let session_id = session.id.clone();
        self.sessions.lock().expect("sessions mutex poisoned").insert(session_id.clone(), session.clone());

        let verdict = self.detector.detect(&initial_response);
        session.add_initial(extract_content(&initial_response), verdict.total_tokens);

        let mut was_truncated = verdict.truncated;
        let mut is_complete = !verdict.truncated;

        if verdict.truncated {
            for attempt in 0..self.config.max_attempts {
                let delay = self
                    .config
                    .backoff_delays
                    .get(attempt as usize)
                    .copied()
                    .unwrap_or_else(|| self.config.backoff_delays.last().copied().unwrap_or(Duration::ZERO));
                tokio::time::sleep(delay).await;

                let prompt = build_continuation_prompt(&original_messages, session.last_chunk());
                let messages = build_continuation_messages(&original_messages, session.last_chunk(), &prompt);

                let response = match provider.call(&messages).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, error = %err, "continuation call failed, stopping with partial content");
                        break;
                    }
                };

                let verdict = self.detector.detect(&response);
                let chunk = extract_content(&response);

                if session.should_continue(&chunk, verdict.total_tokens).is_err() {
                    break;
                }
                session.add_chunk(chunk, verdict.total_tokens);

                if !verdict.truncated {
                    is_complete = true;
                    was_truncated = true;
                    break;
                }
            }
        }

        self.sessions.lock().expect("sessions mutex poisoned").remove(&session_id);

        ContinuationOutcome {
            complete_response: session.chunks.join(""),
            is_complete,
            attempts_made: session.attempt_count,
            total_tokens_used: session.cumulative_tokens,
            was_truncated,
            session_id,
        }
    }
}

fn extract_content(response: &Value) -> String {
    response
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn last_user_message<'a>(messages: &'a [Value]) -> &'a str {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn build_continuation_prompt(original_messages: &[Value], last_chunk: &str) -> String {
    let user_message = last_user_message(original_messages);
    let context = truncate_chars(user_message, 200);
    let tail = truncate_tail_chars(last_chunk, 100);
    format!(
        "Please continue your previous response. Context: you were responding to '{context}'. \
         Your last response was truncated at '…{tail}'. Continue from where you left off."
    )
}

fn build_continuation_messages(original_messages: &[Value], last_chunk: &str, prompt: &str) -> Vec<Value> {
    let mut messages = original_messages.to_vec();
    messages.push(serde_json::json!({ "role": "assistant", "content": last_chunk }));
    messages.push(serde_json::json!({ "role": "user", "content": prompt }));
    messages
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn truncate_tail_chars(s: &str, max: usize) -> String {
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }
    s.chars().skip(len - max).collect()
}
