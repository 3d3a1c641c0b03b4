use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use std::sync::Once;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::{BadgeSet, JobRecord};

pub const BADGE_MODEL: &str = "claude-haiku-4-5-20251001";
pub const BADGE_MAX_TOKENS: u32 = 512;
pub const EXCERPT_CHARS: usize = 8000;
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

static MISSING_KEY_WARNING: Once = Once::new();

const BADGE_SYSTEM_PROMPT: &str = "You extract structured metadata from job listings. \
Return ONLY valid JSON with this exact schema (no markdown, no explanation):\n\
{\n\
  \"min_gpa\": \"3.0\" | null,\n\
  \"visa_sponsorship\": true | false | null,\n\
  \"cpt_opt_required\": true | false,\n\
  \"uiuc_only\": true | false,\n\
  \"class_years\": [\"Freshman\", \"Sophomore\", \"Junior\", \"Senior\"] | [],\n\
  \"majors\": [\"Computer Science\", \"Electrical Engineering\"] | [],\n\
  \"job_type\": \"internship\" | \"full-time\" | \"part-time\",\n\
  \"work_mode\": \"in-person\" | \"remote\" | \"hybrid\" | null,\n\
  \"duration\": \"Summer 2026\" | null\n\
}\n\
Rules:\n\
- visa_sponsorship: true if they sponsor, false if they explicitly don't, null if not mentioned\n\
- cpt_opt_required: true only if CPT or OPT is explicitly mentioned as required\n\
- uiuc_only: true only if restricted to UIUC students\n\
- majors: full names (Computer Science, Mechanical Engineering, etc). Empty list if not specified\n\
- job_type: infer from title and description\n\
- work_mode: null if not mentioned\n\
- duration: specific term like 'Summer 2026', null if not mentioned\n\
- min_gpa: string like '3.0', null if not mentioned\n\
- class_years: list each eligible class year separately. Empty list if not specified";

// --- Provider trait ---

pub trait AIProvider: Send + Sync {
    fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String>;
    #[allow(dead_code)]
    fn model_name(&self) -> &str;
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
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
    pub fn new(api_key: String, model_id: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("ANTHROPIC_API_KEY is empty"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .context("Failed to build Anthropic HTTP client")?;
        Ok(Self {
            api_key,
            model_id,
            client,
        })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            system: system.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Badge extraction ---

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("provider call failed: {0:#}")]
    Provider(anyhow::Error),

    #[error("provider returned an empty response")]
    Empty,

    #[error("response is not JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("response is JSON but not an object")]
    NotObject,
}

/// Removes a surrounding markdown code fence, with or without a `json` tag.
pub fn strip_code_fences(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.starts_with("```") {
        return raw.to_string();
    }
    let (Ok(open), Ok(close)) = (Regex::new(r"^```(?:json)?\s*"), Regex::new(r"\s*```$")) else {
        return raw.to_string();
    };
    let without_open = open.replace(raw, "");
    close.replace(&without_open, "").trim().to_string()
}

pub fn parse_badges(raw: &str) -> Result<BadgeSet, EnrichError> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err(EnrichError::Empty);
    }
    let value: serde_json::Value = serde_json::from_str(&body)?;
    if !value.is_object() {
        return Err(EnrichError::NotObject);
    }
    Ok(serde_json::from_value(value)?)
}

/// Plain text of a description, whitespace collapsed, cut to `EXCERPT_CHARS`.
pub fn description_excerpt(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(EXCERPT_CHARS)
        .collect()
}

fn badge_prompt(job: &JobRecord) -> String {
    format!(
        "Job title: {}\nCompany: {}\n\nDescription:\n{}",
        job.position,
        job.company,
        description_excerpt(&job.raw_description)
    )
}

pub fn extract_badges(provider: &dyn AIProvider, job: &JobRecord) -> Result<BadgeSet, EnrichError> {
    let response = provider
        .complete(BADGE_SYSTEM_PROMPT, &badge_prompt(job), BADGE_MAX_TOKENS)
        .map_err(EnrichError::Provider)?;
    parse_badges(&response)
}

/// Attaches badges to jobs that lack them, on a bounded pool.
///
/// Without a provider every call is a no-op.
pub struct Enricher {
    provider: Option<Box<dyn AIProvider>>,
    pool: rayon::ThreadPool,
}

impl Enricher {
    pub fn new(provider: Option<Box<dyn AIProvider>>, concurrency: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("enrich-{}", i))
            .build()
            .context("Failed to build enrichment thread pool")?;
        Ok(Self { provider, pool })
    }

    /// Uses the Anthropic provider when a key is configured; otherwise warns
    /// (once per process) and disables enrichment.
    pub fn from_api_key(api_key: Option<&str>, concurrency: usize) -> Result<Self> {
        let provider: Option<Box<dyn AIProvider>> = match api_key {
            Some(key) => Some(Box::new(AnthropicProvider::new(
                key.to_string(),
                BADGE_MODEL.to_string(),
            )?)),
            None => {
                MISSING_KEY_WARNING.call_once(|| {
                    warn!("ANTHROPIC_API_KEY not set, skipping badge extraction");
                });
                None
            }
        };
        Self::new(provider, concurrency)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Badges for one job, or `None` when disabled, the description is empty,
    /// or the provider misbehaves.
    pub fn enrich(&self, job: &JobRecord) -> Option<BadgeSet> {
        let provider = self.provider.as_deref()?;
        if job.raw_description.trim().is_empty() {
            return None;
        }
        match extract_badges(provider, job) {
            Ok(badges) => {
                info!("Extracted badges for {}", job.position);
                Some(badges)
            }
            Err(e) => {
                error!("Badge extraction failed for {}: {}", job.position, e);
                None
            }
        }
    }

    /// Enriches every job without badges that has a description. Returns how
    /// many gained badges.
    pub fn enrich_missing(&self, jobs: &mut [JobRecord]) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        self.pool.install(|| {
            jobs.par_iter_mut()
                .filter(|job| job.badges.is_none() && !job.raw_description.trim().is_empty())
                .map(|job| {
                    job.badges = self.enrich(job);
                    job.badges.is_some()
                })
                .filter(|enriched| *enriched)
                .count()
        })
    }
}
