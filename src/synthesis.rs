//! LLM answer synthesis — optional by configuration.
//!
//! The engine holds an `Option<Arc<dyn Synthesizer>>`: absence is a valid
//! configuration checked once at construction, not an error path. When a
//! provider is configured but a call fails (timeout, auth, rate limit),
//! the engine degrades that single request to the extractive fallback in
//! [`extractive_answer`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SynthesisConfig;
use crate::models::{RetrievalResult, SessionTurn};

/// Turns retrieved fragments plus a question into a natural-language
/// answer. Implementations call an external LLM and may fail; the engine
/// recovers by falling back to extraction.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Provider name for logging (`"anthropic"`, `"openai"`).
    fn name(&self) -> &str;

    /// Produce an answer grounded in the given fragments; `history`
    /// carries prior session turns for conversational continuity.
    async fn synthesize(
        &self,
        question: &str,
        results: &[RetrievalResult],
        history: &[SessionTurn],
    ) -> Result<String>;
}

/// Create the configured synthesizer, or `None` when disabled.
pub fn create_synthesizer(config: &SynthesisConfig) -> Result<Option<Arc<dyn Synthesizer>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "anthropic" => Ok(Some(Arc::new(AnthropicSynthesizer::new(config)?))),
        "openai" => Ok(Some(Arc::new(OpenAiSynthesizer::new(config)?))),
        other => bail!("Unknown synthesis provider: {}", other),
    }
}

/// Prior turns included in the prompt, newest last.
const PROMPT_HISTORY_TURNS: usize = 5;

/// Build the grounding prompt: numbered sources, optional conversation
/// history, then the question.
pub fn build_prompt(
    question: &str,
    results: &[RetrievalResult],
    history: &[SessionTurn],
) -> String {
    let mut prompt = String::new();

    if !history.is_empty() {
        prompt.push_str("Previous conversation:\n");
        let skip = history.len().saturating_sub(PROMPT_HISTORY_TURNS);
        for turn in &history[skip..] {
            let answer: String = turn.answer_summary.chars().take(200).collect();
            prompt.push_str(&format!("Q: {}\nA: {}\n", turn.question, answer));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Based on the following sources, answer the query accurately. \
         Cite sources by number. If the sources don't contain enough \
         information, say so.\n\nSources:\n",
    );

    for (i, result) in results.iter().enumerate() {
        prompt.push_str(&format!(
            "[Source {}: {}]\n{}\n\n",
            i + 1,
            result.fragment.document_id,
            result.fragment.text
        ));
    }

    prompt.push_str(&format!("Query: {}\n\nAnswer:", question));
    prompt
}

/// Retrieval-only fallback: a structured summary of the top fragments.
/// Used when no LLM is configured, the call failed, or the deadline ran
/// out before synthesis.
pub fn extractive_answer(question: &str, results: &[RetrievalResult]) -> String {
    if results.is_empty() {
        return "No relevant information found in the knowledge base.".to_string();
    }

    let mut lines = vec![format!(
        "Found {} relevant source(s) for: \"{}\"\n",
        results.len(),
        question
    )];

    for (i, result) in results.iter().take(5).enumerate() {
        let text: String = result.fragment.text.chars().take(300).collect();
        lines.push(format!(
            "[Source {}] ({}, relevance: {:.2})",
            i + 1,
            result.fragment.document_id,
            result.score
        ));
        lines.push(text);
        lines.push(String::new());
    }

    lines.push("Note: no LLM synthesis was performed for this answer.".to_string());
    lines.join("\n")
}

// ============ Anthropic ============

/// Synthesizer backed by the Anthropic messages API.
///
/// Requires the `ANTHROPIC_API_KEY` environment variable.
pub struct AnthropicSynthesizer {
    model: String,
    max_tokens: u32,
    timeout_secs: u64,
}

impl AnthropicSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthesis.model required for Anthropic provider"))?;

        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            bail!("ANTHROPIC_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Synthesizer for AnthropicSynthesizer {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn synthesize(
        &self,
        question: &str,
        results: &[RetrievalResult],
        history: &[SessionTurn],
    ) -> Result<String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let prompt = build_prompt(question, results, history);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Anthropic API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("content")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Anthropic response: missing content text"))
    }
}

// ============ OpenAI ============

/// Synthesizer backed by the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiSynthesizer {
    model: String,
    max_tokens: u32,
    timeout_secs: u64,
}

impl OpenAiSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthesis.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(
        &self,
        question: &str,
        results: &[RetrievalResult],
        history: &[SessionTurn],
    ) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let prompt = build_prompt(question, results, history);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fragment;

    fn make_result(doc_id: &str, text: &str, score: f64, rank: usize) -> RetrievalResult {
        RetrievalResult {
            fragment: Fragment {
                id: format!("{}-0", doc_id),
                document_id: doc_id.to_string(),
                position: 0,
                text: text.to_string(),
                created_at: 0,
            },
            score,
            rank,
        }
    }

    #[test]
    fn test_prompt_numbers_sources() {
        let results = vec![
            make_result("doc1", "Alpha text.", 0.9, 1),
            make_result("doc2", "Beta text.", 0.8, 2),
        ];
        let prompt = build_prompt("What is alpha?", &results, &[]);
        assert!(prompt.contains("[Source 1: doc1]"));
        assert!(prompt.contains("[Source 2: doc2]"));
        assert!(prompt.contains("Query: What is alpha?"));
        assert!(!prompt.contains("Previous conversation"));
    }

    #[test]
    fn test_prompt_includes_recent_history_only() {
        let history: Vec<SessionTurn> = (0..8)
            .map(|i| SessionTurn {
                question: format!("question {}", i),
                answer_summary: format!("answer {}", i),
                fragment_ids: vec![],
                created_at: i,
            })
            .collect();
        let prompt = build_prompt("next?", &[], &history);
        assert!(prompt.contains("Previous conversation"));
        // Only the last 5 turns make it into the prompt
        assert!(!prompt.contains("question 2"));
        assert!(prompt.contains("question 3"));
        assert!(prompt.contains("question 7"));
    }

    #[test]
    fn test_extractive_answer_empty() {
        let answer = extractive_answer("anything", &[]);
        assert!(answer.contains("No relevant information"));
    }

    #[test]
    fn test_extractive_answer_cites_and_flags_no_llm() {
        let results = vec![make_result("doc1", "Bitcoin reached $100k in 2025", 0.91, 1)];
        let answer = extractive_answer("What happened with Bitcoin?", &results);
        assert!(answer.contains("[Source 1]"));
        assert!(answer.contains("Bitcoin reached $100k"));
        assert!(answer.contains("no LLM synthesis"));
    }

    #[test]
    fn test_create_synthesizer_disabled_is_none() {
        let config = SynthesisConfig::default();
        let synthesizer = create_synthesizer(&config).unwrap();
        assert!(synthesizer.is_none());
    }
}
