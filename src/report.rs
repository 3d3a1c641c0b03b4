use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::America::Chicago;
use std::collections::BTreeMap;
use std::path::Path;

use crate::diff::sort_by_recency;
use crate::models::JobRecord;
use crate::snapshot::write_atomic;

const MAX_BAR: usize = 40;
const MIN_HISTOGRAM_POSTINGS: usize = 3;

pub fn format_posted(job: &JobRecord) -> String {
    if let Some(parsed) = job.posted_at_parsed {
        return parsed
            .with_timezone(&Chicago)
            .format("%b %d, %Y %I:%M %p %Z")
            .to_string();
    }
    let raw = job.posted_at_raw.trim();
    if raw.is_empty() {
        return "N/A".to_string();
    }
    raw.chars().take(16).collect()
}

fn hour_label(hour: u32) -> String {
    match hour {
        0 => "12 AM".to_string(),
        1..=11 => format!("{} AM", hour),
        12 => "12 PM".to_string(),
        _ => format!("{} PM", hour - 12),
    }
}

/// Hour-of-day bar chart in Chicago time, or `None` with fewer than three
/// dated postings.
pub fn posting_histogram(jobs: &[JobRecord]) -> Option<String> {
    let hours: Vec<u32> = jobs
        .iter()
        .filter_map(|job| job.posted_at_parsed)
        .map(|dt| dt.with_timezone(&Chicago).hour())
        .collect();
    if hours.len() < MIN_HISTOGRAM_POSTINGS {
        return None;
    }

    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for hour in &hours {
        *counts.entry(*hour).or_insert(0) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(1);

    let mut lines = vec![
        "## Posting Time Distribution".to_string(),
        String::new(),
        format!("### Job Posting Times (Based on {} postings)", hours.len()),
        String::new(),
        "```".to_string(),
        "Jobs".to_string(),
        String::new(),
    ];
    for (hour, count) in &counts {
        let bar = "█".repeat(count * MAX_BAR / max);
        lines.push(format!("{:>6} │{} {}", hour_label(*hour), bar, count));
    }
    lines.push(format!("       └{}", "─".repeat(MAX_BAR)));
    lines.push(format!("        0{}{}", " ".repeat(MAX_BAR - 1), max));
    lines.push("```".to_string());

    Some(lines.join("\n"))
}

pub fn render_report(jobs: &[JobRecord], now: DateTime<Utc>) -> String {
    let mut sorted = jobs.to_vec();
    sort_by_recency(&mut sorted);

    let rows: Vec<String> = sorted
        .iter()
        .map(|job| {
            format!(
                "| {} | {} | {} | [Apply]({}) |",
                job.company.replace('|', "-"),
                job.position.replace('|', "-"),
                format_posted(job),
                job.link
            )
        })
        .collect();

    let updated = now.with_timezone(&Chicago).format("%B %d, %Y at %I:%M %p %Z");
    let histogram = posting_histogram(jobs)
        .map(|chart| format!("\n{}\n", chart))
        .unwrap_or_default();

    format!(
        "# UIUC Research Park Jobs List\n\n\
         Auto-updated job listings from the [University of Illinois Research Park](https://researchpark.illinois.edu).\n\n\
         **Updated:** {} | **Total:** {}\n\n\
         ---\n\n\
         | Company | Position | Posted | Link |\n\
         | ------- | -------- | ------ | ---- |\n\
         {}\n\n\
         {}\n\
         ---\n\n\
         ## About This Project\n\n\
         This list is generated from the Research Park job feed and refreshed on every run.\n\n\
         - **Source:** [Research Park Job Board](https://researchpark.illinois.edu/work-here/careers/)\n\n\
         ### How It Works\n\n\
         1. The feed is fetched page by page\n\
         2. Listings are compared against the previous snapshot\n\
         3. New listings are tagged, announced by email and added to this table\n",
        updated,
        jobs.len(),
        rows.join("\n"),
        histogram
    )
}

pub fn write_report(path: &Path, jobs: &[JobRecord], now: DateTime<Utc>) -> Result<()> {
    write_atomic(path, render_report(jobs, now).as_bytes())
        .with_context(|| format!("Failed to write report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(id: &str, posted: Option<DateTime<Utc>>, raw: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            company: format!("Company {}", id),
            position: format!("Position {}", id),
            link: format!("https://example.com/{}", id),
            posted_at_raw: raw.to_string(),
            posted_at_parsed: posted,
            discovered_at: None,
            badges: None,
            raw_description: String::new(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_format_posted() {
        assert_eq!(format_posted(&job("a", Some(at(15, 30)), "")), "Nov 04, 2025 09:30 AM CST");
        assert_eq!(format_posted(&job("b", None, "")), "N/A");
        assert_eq!(
            format_posted(&job("c", None, "sometime early next week maybe")),
            "sometime early n"
        );
    }

    #[test]
    fn test_hour_labels() {
        assert_eq!(hour_label(0), "12 AM");
        assert_eq!(hour_label(9), "9 AM");
        assert_eq!(hour_label(12), "12 PM");
        assert_eq!(hour_label(23), "11 PM");
    }

    #[test]
    fn test_histogram_needs_three_postings() {
        let jobs = vec![job("a", Some(at(15, 0)), ""), job("b", Some(at(16, 0)), ""), job("c", None, "")];
        assert!(posting_histogram(&jobs).is_none());
    }

    #[test]
    fn test_histogram_scales_bars() {
        // 15:xx UTC is 9 AM in Chicago in November; 20:xx is 2 PM.
        let jobs = vec![
            job("a", Some(at(15, 0)), ""),
            job("b", Some(at(15, 45)), ""),
            job("c", Some(at(20, 10)), ""),
        ];
        let chart = posting_histogram(&jobs).unwrap();
        assert!(chart.contains("(Based on 3 postings)"));
        assert!(chart.contains(&format!("  9 AM │{} 2", "█".repeat(40))));
        assert!(chart.contains(&format!("  2 PM │{} 1", "█".repeat(20))));
        assert!(chart.contains(&format!("       └{}", "─".repeat(40))));
    }

    #[test]
    fn test_report_sorted_and_sanitized() {
        let mut piped = job("old", Some(at(10, 0)), "");
        piped.position = "Intern | Data".to_string();
        let jobs = vec![piped, job("undated", None, ""), job("new", Some(at(18, 0)), "")];

        let report = render_report(&jobs, at(21, 0));
        assert!(report.contains("**Total:** 3"));
        assert!(report.contains("Intern - Data"));

        let new_pos = report.find("Company new").unwrap();
        let old_pos = report.find("Company old").unwrap();
        let undated_pos = report.find("Company undated").unwrap();
        assert!(new_pos < old_pos && old_pos < undated_pos);
        assert!(!report.contains("Posting Time Distribution"));
    }

    #[test]
    fn test_write_report() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("site").join("JOBS.md");
        write_report(&path, &[], at(12, 0)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# UIUC Research Park Jobs List"));
        assert!(text.contains("**Total:** 0"));
        assert!(text.contains("## About This Project"));
    }
}
