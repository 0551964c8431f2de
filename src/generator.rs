use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::LlmError;

/// Fixed system instruction prefixed to every prompt. A configuration
/// constant, not computed; replace the template to retarget the assistant.
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant answering questions about an \
     indexed document collection. Answer the question based on the provided context from those \
     documents. If the answer is not in the context, say so clearly. Be concise and accurate in \
     your responses.";

const MIN_ANSWER_CHARS: usize = 20;

/// The retrieved text handed to the generator, already filtered and ordered
/// by the orchestrator. The generator never truncates: context length
/// governance happens before this point so generation stays deterministic
/// given its input.
#[derive(Debug, Clone)]
pub struct ContextChunk {
    pub text: String,
    pub document_id: String,
    pub document_title: String,
}

/// Seam to the text-generation backend. Production uses [`OllamaGenerator`];
/// tests substitute canned completions.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;

    /// Start a streaming generation. Fragments arrive on the returned
    /// channel; dropping the receiver cancels the upstream request, and no
    /// further fragments are produced after that.
    async fn generate_stream(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError>;

    fn model_name(&self) -> &str;
}

/// Build the full prompt: system instruction, context grouped by source
/// document (one header per document, not per chunk), question, answer cue.
pub fn build_prompt(question: &str, chunks: &[ContextChunk]) -> String {
    let mut context_parts: Vec<String> = Vec::new();
    let mut current_doc: Option<&str> = None;
    let mut source_number = 0;

    for chunk in chunks {
        if current_doc != Some(chunk.document_id.as_str()) {
            source_number += 1;
            context_parts.push(format!(
                "[Source {}: {}]\n{}",
                source_number, chunk.document_title, chunk.text
            ));
            current_doc = Some(chunk.document_id.as_str());
        } else {
            // Same document as the previous chunk: append under its header.
            if let Some(last) = context_parts.last_mut() {
                last.push_str("\n\n");
                last.push_str(&chunk.text);
            }
        }
    }

    let context = context_parts.join("\n\n");

    format!("{SYSTEM_INSTRUCTION}\n\nContext:\n{context}\n\nQuestion: {question}\n\nAnswer:")
}

fn blank_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

fn bullet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*(?:[-*•]|\d+[.)])\s+").expect("valid regex"))
}

fn contact_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Email addresses or phone-looking digit runs.
    RE.get_or_init(|| {
        Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+|\+?\d[\d\s()/-]{7,}\d").expect("valid regex")
    })
}

/// Light cleanup applied to every generated answer: collapse 3+ blank lines,
/// give list items breathing room, and bold lines carrying contact details
/// so they stand out in a chat UI.
pub fn postprocess_answer(answer: &str) -> String {
    let collapsed = blank_run_regex().replace_all(answer.trim(), "\n\n");

    let mut lines: Vec<String> = Vec::new();
    let mut prev_was_list = false;
    for line in collapsed.lines() {
        let is_list = bullet_regex().is_match(line);

        // Blank line before a list starts, if the text ran straight into it.
        if is_list && !prev_was_list {
            if let Some(last) = lines.last() {
                if !last.trim().is_empty() {
                    lines.push(String::new());
                }
            }
        }

        let trimmed = line.trim_end();
        if !is_list
            && contact_regex().is_match(trimmed)
            && !trimmed.is_empty()
            && !trimmed.starts_with("**")
        {
            lines.push(format!("**{trimmed}**"));
        } else {
            lines.push(trimmed.to_string());
        }
        prev_was_list = is_list;
    }

    lines.join("\n")
}

/// Best-effort sanity check on a generated answer. Only logs; a weak answer
/// is still returned to the caller.
fn quality_check(question: &str, answer: &str) {
    if answer.len() < MIN_ANSWER_CHARS {
        tracing::warn!(
            answer_len = answer.len(),
            "Generated answer is suspiciously short"
        );
    }
    if answer.trim().eq_ignore_ascii_case(question.trim()) {
        tracing::warn!("Generated answer merely repeats the question");
    }
}

/// Assembles prompts and drives the generation backend.
pub struct AnswerGenerator {
    backend: Arc<dyn GenerationBackend>,
}

impl AnswerGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Generate a complete answer for `question` grounded in `chunks`.
    pub async fn answer(
        &self,
        question: &str,
        chunks: &[ContextChunk],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        if question.trim().is_empty() {
            return Err(LlmError::EmptyQuestion);
        }
        if chunks.is_empty() {
            tracing::warn!("No context chunks provided, generating answer without context");
        }

        let prompt = build_prompt(question, chunks);
        tracing::debug!(prompt_len = prompt.len(), "Generating answer");

        let raw = self
            .backend
            .generate(&prompt, temperature, max_tokens)
            .await?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LlmError::EmptyAnswer);
        }

        quality_check(question, raw);
        Ok(postprocess_answer(raw))
    }

    /// Start a streaming generation; fragments arrive raw (post-formatting
    /// only applies to complete answers).
    pub async fn answer_stream(
        &self,
        question: &str,
        chunks: &[ContextChunk],
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        if question.trim().is_empty() {
            return Err(LlmError::EmptyQuestion);
        }
        let prompt = build_prompt(question, chunks);
        self.backend.generate_stream(&prompt, temperature).await
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaGenerateOptions,
}

#[derive(Serialize)]
struct OllamaGenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Generation client against the Ollama `/api/generate` endpoint. Streaming
/// responses are newline-delimited JSON, decoded incrementally.
pub struct OllamaGenerator {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(settings: &Settings) -> Result<Self, LlmError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(settings.generate_timeout())
                .build()
                .map_err(|e| LlmError::Backend(e.to_string()))?,
            ollama_url: settings.ollama_url.clone(),
            model: settings.llm_model.clone(),
        })
    }

    /// Verify the backend is reachable and the generation model is pulled.
    pub async fn preflight(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.ollama_url))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(LlmError::Unreachable {
                url: self.ollama_url.clone(),
            });
        }

        let tags: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        let exists = tags["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .any(|m| m["name"].as_str().unwrap_or("").starts_with(&self.model))
            })
            .unwrap_or(false);

        if !exists {
            return Err(LlmError::ModelMissing {
                model: self.model.clone(),
            });
        }

        tracing::info!("Generation model '{}' verified", self.model);
        Ok(())
    }

    fn classify(&self, e: reqwest::Error) -> LlmError {
        if e.is_connect() || e.is_timeout() {
            LlmError::Unreachable {
                url: self.ollama_url.clone(),
            }
        } else {
            LlmError::Backend(e.to_string())
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaGenerateOptions {
                temperature,
                num_predict: Some(max_tokens),
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.ollama_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Backend(format!("{status} - {body}")));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        Ok(parsed["response"].as_str().unwrap_or_default().to_string())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: OllamaGenerateOptions {
                temperature,
                num_predict: None,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.ollama_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Backend(format!("{status} - {body}")));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut byte_stream = response.bytes_stream();

        // Decode NDJSON incrementally. A failed send means the receiver was
        // dropped: stop reading so the HTTP body is released promptly.
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(item) = byte_stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OllamaGenerateChunk>(line) {
                        Ok(chunk) => {
                            if !chunk.response.is_empty()
                                && tx.send(Ok(chunk.response)).await.is_err()
                            {
                                return;
                            }
                            if chunk.done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
