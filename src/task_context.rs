//! TaskContext analyzer (component D): infers task type, complexity, token estimates, and GPU
//! need from a request payload. Pure and deterministic -- no I/O, per SPEC_FULL §4.4.
//!
//! Grounded on `llama_worker.rs::classify_complexity()`'s keyword-first classification and
//! `router.rs`'s static keyword-table + count-scoring pattern.

use serde::{Deserialize, Serialize};

use crate::hybrid_router::model_param_billions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Generation,
    Summarization,
    Classification,
    Extraction,
    Embedding,
    Chat,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub estimated_input_tokens: u32,
    pub estimated_output_tokens: u32,
    pub estimated_duration_ms: u64,
    pub requires_gpu: bool,
    pub model_preference: Option<String>,
    pub priority: u8,
}

/// Request shape the analyzer reads from; a structural subset of the Ollama wire payload.
pub struct RequestPayload<'a> {
    pub model: &'a str,
    pub prompt: Option<&'a str>,
    pub system: Option<&'a str>,
    pub has_messages: bool,
}

const SUMMARIZE_KEYWORDS: &[&str] = &["summarize", "summary", "tl;dr", "condense"];
const CLASSIFY_KEYWORDS: &[&str] = &["classify", "categorize", "which category", "label this"];
const EXTRACT_KEYWORDS: &[&str] = &["extract", "pull out", "identify the", "list all"];
const ANALYZE_KEYWORDS: &[&str] = &["analyze", "detailed", "in depth", "thorough analysis"];

const THROUGHPUT_TOKENS_PER_SEC_CPU: f64 = 15.0;
const THROUGHPUT_TOKENS_PER_SEC_GPU: f64 = 60.0;

/// A (node, task_type, model) throughput hint from PerformanceMemory, used in place of the
/// fallback constants above when enough history exists.
pub struct ThroughputHint {
    pub tokens_per_sec: f64,
}

pub fn analyze(payload: &RequestPayload, priority: u8, throughput_hint: Option<ThroughputHint>) -> TaskContext {
    let haystack = format!(
        "{} {}",
        payload.prompt.unwrap_or_default(),
        payload.system.unwrap_or_default()
    )
    .to_lowercase();

    let task_type = classify_task_type(payload, &haystack);
    let input_len = payload.prompt.map(str::len).unwrap_or(0);
    let complexity = classify_complexity(input_len, &haystack);

    let estimated_input_tokens = (input_len as f64 / 3.5).ceil() as u32;
    let estimated_output_tokens = estimate_output_tokens(task_type, estimated_input_tokens);

    let model_params_b = model_param_billions(payload.model);
    let requires_gpu =
        complexity == Complexity::High || estimated_output_tokens >= 256 || model_params_b >= 13;

    let tokens_per_sec = throughput_hint
        .map(|h| h.tokens_per_sec)
        .unwrap_or(if requires_gpu {
            THROUGHPUT_TOKENS_PER_SEC_GPU
        } else {
            THROUGHPUT_TOKENS_PER_SEC_CPU
        });
    let total_tokens = (estimated_input_tokens + estimated_output_tokens).max(1) as f64;
    let estimated_duration_ms = ((total_tokens / tokens_per_sec) * 1000.0) as u64;

    TaskContext {
        task_type,
        complexity,
        estimated_input_tokens,
        estimated_output_tokens,
        estimated_duration_ms,
        requires_gpu,
        model_preference: Some(payload.model.to_string()),
        priority: priority.clamp(1, 10),
    }
}

fn classify_task_type(payload: &RequestPayload, haystack: &str) -> TaskType {
    if payload.model.to_lowercase().contains("embed") {
        return TaskType::Embedding;
    }
    if SUMMARIZE_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        return TaskType::Summarization;
    }
    if CLASSIFY_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        return TaskType::Classification;
    }
    if EXTRACT_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        return TaskType::Extraction;
    }
    if payload.has_messages {
        return TaskType::Chat;
    }
    TaskType::Generation
}

fn classify_complexity(input_len: usize, haystack: &str) -> Complexity {
    let bucket = if input_len <= 200 {
        Complexity::Low
    } else if input_len <= 2000 {
        Complexity::Medium
    } else {
        Complexity::High
    };

    if ANALYZE_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        return bucket.max(Complexity::Medium);
    }
    bucket
}

fn estimate_output_tokens(task_type: TaskType, input_tokens: u32) -> u32 {
    match task_type {
        TaskType::Summarization => (input_tokens as f64 * 0.3) as u32,
        TaskType::Generation | TaskType::Chat | TaskType::Analysis => input_tokens * 2,
        TaskType::Classification => 32,
        TaskType::Extraction => input_tokens,
        TaskType::Embedding => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload<'a>(prompt: &'a str) -> RequestPayload<'a> {
        RequestPayload {
            model: "llama3.2:3b",
            prompt: Some(prompt),
            system: None,
            has_messages: false,
        }
    }

    #[test]
    fn summarize_keyword_selects_summarization_type() {
        let ctx = analyze(&payload("Please summarize this article for me"), 5, None);
        assert_eq!(ctx.task_type, TaskType::Summarization);
    }

    #[test]
    fn short_prompt_is_low_complexity() {
        let ctx = analyze(&payload("hi"), 5, None);
        assert_eq!(ctx.complexity, Complexity::Low);
    }

    #[test]
    fn long_prompt_is_high_complexity_and_requires_gpu() {
        let long_prompt = "x".repeat(3000);
        let ctx = analyze(&payload(&long_prompt), 5, None);
        assert_eq!(ctx.complexity, Complexity::High);
        assert!(ctx.requires_gpu);
    }

    #[test]
    fn large_model_requires_gpu_regardless_of_complexity() {
        let req = RequestPayload {
            model: "llama3:70b",
            prompt: Some("hi"),
            system: None,
            has_messages: false,
        };
        let ctx = analyze(&req, 5, None);
        assert!(ctx.requires_gpu);
    }

    #[test]
    fn priority_is_clamped_to_valid_range() {
        let ctx = analyze(&payload("hi"), 255, None);
        assert_eq!(ctx.priority, 10);
    }

    #[test]
    fn analyzer_is_deterministic() {
        let a = analyze(&payload("analyze this in depth"), 7, None);
        let b = analyze(&payload("analyze this in depth"), 7, None);
        assert_eq!(a.complexity, b.complexity);
        assert_eq!(a.estimated_input_tokens, b.estimated_input_tokens);
    }
}
