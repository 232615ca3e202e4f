use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::db::Database;
use crate::models::Listing;
use crate::status::JobStatus;
use crate::storage::DescriptionStore;

/// Summary stamped on listings of blacklisted jobs so they are never sent
/// to a model.
pub const BLACKLIST_MARKER: &str = "blacklist";
/// Summary for a listing whose description is missing or empty.
pub const NOT_AVAILABLE: &str = "N/A";
/// Degenerate generations come back as runs of exclamation marks.
const DEGENERATE: &str = "!!!!!!";

const SUMMARY_PROMPT: &str =
    "Please create a single sentence summary of this job description without any corporate fluff.";
const SUMMARY_MAX_TOKENS: u32 = 512;

// --- Provider trait ---

pub trait Provider: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// Description text in, one-sentence summary out.
pub trait Summarizer {
    fn summarize(&self, description: &str) -> Result<String>;
}

/// Summarizer backed by a language model provider.
pub struct ModelSummarizer {
    provider: Box<dyn Provider>,
}

impl ModelSummarizer {
    pub fn new(provider: Box<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn from_model_name(name: &str) -> Result<Self> {
        let spec = resolve_model(name)?;
        info!(model = %spec.short_name, id = %spec.model_id, "using summary model");
        Ok(Self::new(create_provider(&spec)?))
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }
}

impl Summarizer for ModelSummarizer {
    fn summarize(&self, description: &str) -> Result<String> {
        let prompt = format!("{}\n\nJob description:\n{}", SUMMARY_PROMPT, description);
        Ok(self.provider.complete(&prompt, SUMMARY_MAX_TOKENS)?.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    ClaudeCode,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

impl ModelSpec {
    fn new(provider: ProviderKind, model_id: &str, short_name: &str) -> Self {
        Self {
            provider,
            model_id: model_id.to_string(),
            short_name: short_name.to_string(),
        }
    }
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let spec = match name {
        // `claude` CLI, no API key needed
        "claude-haiku" | "haiku" => ModelSpec::new(ProviderKind::ClaudeCode, "claude-haiku-4-5-20251001", "claude-haiku"),
        "claude-sonnet" | "sonnet" => {
            ModelSpec::new(ProviderKind::ClaudeCode, "claude-sonnet-4-5-20250929", "claude-sonnet")
        }
        // Anthropic API (ANTHROPIC_API_KEY)
        "api-haiku" => ModelSpec::new(ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
        "api-sonnet" => ModelSpec::new(ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet"),
        // OpenAI API (OPENAI_API_KEY)
        "gpt-4o-mini" => ModelSpec::new(ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
        "gpt-4o" => ModelSpec::new(ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: claude-haiku (default), claude-sonnet, \
                 api-haiku, api-sonnet, gpt-4o-mini, gpt-4o",
                name
            ));
        }
    };
    Ok(spec)
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn Provider>> {
    Ok(match spec.provider {
        ProviderKind::ClaudeCode => Box::new(ClaudeCodeProvider::new(spec.model_id.clone())?),
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(spec.model_id.clone())?),
        ProviderKind::OpenAI => Box::new(OpenAIProvider::new(spec.model_id.clone())?),
    })
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self {
            api_key,
            model_id,
            client,
        })
    }
}

impl Provider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage::user(prompt)],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("Anthropic API request failed with status {}: {}", status, error_text));
        }

        let body = response.text().context("Failed to read Anthropic API response")?;
        parse_anthropic_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

fn parse_anthropic_response(body: &str) -> Result<String> {
    let response: AnthropicResponse =
        serde_json::from_str(body).context("Failed to parse Anthropic API response")?;
    response
        .content
        .into_iter()
        .next()
        .map(|block| block.text)
        .ok_or_else(|| anyhow!("No content in Anthropic API response"))
}

// --- Claude CLI provider ---

#[derive(Debug)]
pub struct ClaudeCodeProvider {
    model_id: String,
}

impl ClaudeCodeProvider {
    pub fn new(model_id: String) -> Result<Self> {
        std::process::Command::new("claude")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .context("'claude' CLI not found. Install it or use api-haiku/gpt-4o-mini instead.")?;
        Ok(Self { model_id })
    }
}

impl Provider for ClaudeCodeProvider {
    fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        let output = std::process::Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&self.model_id)
            .output()
            .context("Failed to run 'claude' CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("claude CLI failed: {}", stderr));
        }

        let response = String::from_utf8(output.stdout).context("Invalid UTF-8 in claude CLI output")?;
        if response.trim().is_empty() {
            return Err(anyhow!("Empty response from claude CLI"));
        }
        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self {
            api_key,
            model_id,
            client,
        })
    }
}

impl Provider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage::user(prompt)],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("OpenAI API request failed with status {}: {}", status, error_text));
        }

        let body = response.text().context("Failed to read OpenAI API response")?;
        parse_openai_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

fn parse_openai_response(body: &str) -> Result<String> {
    let response: OpenAIResponse = serde_json::from_str(body).context("Failed to parse OpenAI API response")?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
}

// --- Summary maintenance ---

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SummaryReport {
    pub marked_blacklist: usize,
    pub summarized: usize,
    pub not_available: usize,
    pub failed: usize,
}

/// Summary for one description, retried once if the first answer is
/// degenerate. Empty descriptions are never sent.
pub fn summarize_description(summarizer: &dyn Summarizer, description: &str) -> Result<String> {
    if description.trim().is_empty() {
        return Ok(NOT_AVAILABLE.to_string());
    }
    let summary = summarizer.summarize(description)?;
    if summary.contains(DEGENERATE) {
        return summarizer.summarize(description);
    }
    Ok(summary)
}

/// Fill in listing summaries for one user: blacklisted jobs get the marker,
/// triage and reading jobs get a generated summary.
pub fn summarize_pending(
    db: &Database,
    store: &dyn DescriptionStore,
    summarizer: &dyn Summarizer,
    user_id: i64,
) -> Result<SummaryReport> {
    let mut report = SummaryReport::default();

    let blacklisted = db.listings_by_job_status(
        Some(user_id),
        &[JobStatus::Blacklist, JobStatus::EasyFilter],
        Some(&[""][..]),
    )?;
    for listing in &blacklisted {
        db.set_listing_summary(&listing.key(), BLACKLIST_MARKER)?;
        report.marked_blacklist += 1;
    }

    let pending = db.listings_by_job_status(
        Some(user_id),
        &[JobStatus::New, JobStatus::Interested],
        Some(&["", NOT_AVAILABLE][..]),
    )?;
    for listing in &pending {
        match summarize_listing(store, summarizer, listing) {
            Ok(summary) => {
                if summary == NOT_AVAILABLE {
                    report.not_available += 1;
                } else {
                    report.summarized += 1;
                }
                db.set_listing_summary(&listing.key(), &summary)?;
            }
            Err(e) => {
                warn!(listing = %listing.key(), error = %e, "failed to summarize listing");
                report.failed += 1;
            }
        }
    }

    info!(
        user_id,
        blacklist = report.marked_blacklist,
        summarized = report.summarized,
        not_available = report.not_available,
        failed = report.failed,
        "summaries updated"
    );
    Ok(report)
}

fn summarize_listing(store: &dyn DescriptionStore, summarizer: &dyn Summarizer, listing: &Listing) -> Result<String> {
    let description = store.read(&listing.key())?.unwrap_or_default();
    summarize_description(summarizer, &description)
}
