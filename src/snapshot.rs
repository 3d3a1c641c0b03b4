use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::info;

use crate::models::JobRecord;

/// Previous run's board. A missing file is a first run; anything unreadable
/// is an error so a corrupt snapshot never turns the whole board "new".
pub fn load(path: &Path) -> Result<Vec<JobRecord>> {
    if !path.exists() {
        info!("No snapshot at {}; treating this as the first run", path.display());
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("Malformed snapshot {}", path.display()))
}

/// Writes via a sibling temp file and rename, creating parent directories.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Replaces the snapshot wholesale. Written to a sibling temp file and renamed.
pub fn save(path: &Path, jobs: &[JobRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(jobs)?;
    write_atomic(path, json.as_bytes())
}

/// New-jobs artifact: a JSON array, or an empty file when nothing is new.
pub fn write_new_jobs(path: &Path, jobs: &[JobRecord]) -> Result<()> {
    if jobs.is_empty() {
        return write_atomic(path, b"");
    }
    let json = serde_json::to_string_pretty(jobs)?;
    write_atomic(path, json.as_bytes())
}

/// Fetches a published snapshot, e.g. the raw `jobs.json` of a deployment.
pub fn fetch_published(url: &str) -> Result<Vec<JobRecord>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let jobs = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()?
        .json()
        .with_context(|| format!("Malformed board at {}", url))?;
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BadgeSet;
    use tempfile::TempDir;

    fn job(id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            company: "Acme".to_string(),
            position: "Intern".to_string(),
            link: format!("https://example.com/{}", id),
            posted_at_raw: "Tue, 04 Nov 2025 15:30:00 +0000".to_string(),
            posted_at_parsed: None,
            discovered_at: None,
            badges: Some(BadgeSet::default()),
            raw_description: "<p>transient</p>".to_string(),
        }
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load(&tmp.path().join("jobs.json")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_snapshot_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("jobs.json");
        fs::write(&path, "{\"not\": \"a list\"").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_save_then_load_drops_description() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("jobs.json");
        save(&path, &[job("a"), job("b")]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("transient"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, "b");
        assert_eq!(loaded[0].badges, Some(BadgeSet::default()));
    }

    #[test]
    fn test_save_replaces_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("jobs.json");
        save(&path, &[job("a"), job("b"), job("c")]).unwrap();
        save(&path, &[job("z")]).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "z");
    }

    #[test]
    fn test_write_new_jobs_marker() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("new_jobs.json");

        write_new_jobs(&path, &[job("a")]).unwrap();
        let parsed: Vec<JobRecord> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);

        write_new_jobs(&path, &[]).unwrap();
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
