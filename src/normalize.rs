use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::feed::RawListing;
use crate::models::JobRecord;

/// Stable identity for a listing: the trimmed guid when present, else the
/// trimmed link. Keys are compared byte-for-byte; no case folding or URL
/// canonicalization, so `?p=1` and `?P=1` are different listings.
pub fn identity_key(raw: &RawListing) -> String {
    raw.guid
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| raw.link.trim())
        .to_string()
}

/// RSS `pubDate` is RFC 2822; some feeds emit RFC 3339 instead.
pub fn parse_posted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn normalize(raw: &RawListing) -> JobRecord {
    let posted_at_raw = raw.published.as_deref().map(str::trim).unwrap_or_default().to_string();
    JobRecord {
        id: identity_key(raw),
        company: raw.company.clone().unwrap_or_else(|| "N/A".to_string()),
        position: raw.title.trim().to_string(),
        link: raw.link.trim().to_string(),
        posted_at_parsed: parse_posted_at(&posted_at_raw),
        posted_at_raw,
        discovered_at: None,
        badges: None,
        raw_description: raw.description_html.clone(),
    }
}

/// Normalizes a run's listings. Repeated ids keep their first occurrence;
/// entries with neither guid nor link are dropped.
pub fn normalize_board(listings: &[RawListing]) -> Vec<JobRecord> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(listings.len());

    for raw in listings {
        let job = normalize(raw);
        if job.id.is_empty() {
            warn!("Skipping listing without guid or link: {:?}", job.position);
            continue;
        }
        if !seen.insert(job.id.clone()) {
            debug!("Dropping duplicate listing {}", job.id);
            continue;
        }
        jobs.push(job);
    }

    jobs
}
