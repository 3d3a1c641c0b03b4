use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FEED_URL: &str = "https://researchpark.illinois.edu/?feed=job_feed";
pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 465;
pub const DEFAULT_ENRICH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub sender: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub database_path: PathBuf,
    pub jobs_file: PathBuf,
    pub new_jobs_file: PathBuf,
    pub report_file: PathBuf,
    pub mail: Option<MailSettings>,
    pub admin_recipients: Vec<String>,
    pub anthropic_api_key: Option<String>,
    pub app_url: Option<String>,
    pub admin_key: Option<String>,
    pub board_url: Option<String>,
    pub enrich_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_path = match get("DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => crate::db::default_path()?,
        };

        let mail = match (get("EMAIL_SENDER"), get("EMAIL_PASSWORD")) {
            (Some(sender), Some(password)) => {
                let port = match get("SMTP_PORT") {
                    Some(raw) => raw
                        .parse::<u16>()
                        .with_context(|| format!("SMTP_PORT is not a valid port: {}", raw))?,
                    None => DEFAULT_SMTP_PORT,
                };
                Some(MailSettings {
                    sender,
                    password,
                    host: get("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
                    port,
                    timeout: Duration::from_secs(30),
                })
            }
            _ => None,
        };

        let enrich_concurrency = match get("ENRICH_CONCURRENCY") {
            Some(raw) => {
                let n = raw
                    .parse::<usize>()
                    .with_context(|| format!("ENRICH_CONCURRENCY is not a number: {}", raw))?;
                if n == 0 {
                    return Err(anyhow!("ENRICH_CONCURRENCY must be at least 1"));
                }
                n
            }
            None => DEFAULT_ENRICH_CONCURRENCY,
        };

        Ok(Self {
            feed_url: get("FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            database_path,
            jobs_file: PathBuf::from(get("JOBS_FILE").unwrap_or_else(|| "jobs.json".to_string())),
            new_jobs_file: PathBuf::from(
                get("NEW_JOBS_FILE").unwrap_or_else(|| "new_jobs.json".to_string()),
            ),
            report_file: PathBuf::from(get("REPORT_FILE").unwrap_or_else(|| "JOBS.md".to_string())),
            mail,
            admin_recipients: parse_recipients(&get("EMAIL_RECIPIENTS").unwrap_or_default()),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            app_url: get("APP_URL").map(|url| url.trim_end_matches('/').to_string()),
            admin_key: get("ADMIN_KEY"),
            board_url: get("BOARD_URL"),
            enrich_concurrency,
        })
    }

    /// Gate for admin-only operations.
    pub fn require_admin(&self, provided: Option<&str>) -> Result<()> {
        let Some(expected) = &self.admin_key else {
            return Err(anyhow!("ADMIN_KEY not configured"));
        };
        match provided {
            Some(key) if key == expected => Ok(()),
            _ => Err(anyhow!("Unauthorized")),
        }
    }
}

/// Splits a comma-separated recipient list, dropping blanks and
/// case-insensitive duplicates.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .filter(|r| seen.insert(r.to_lowercase()))
        .map(str::to_string)
        .collect()
}
