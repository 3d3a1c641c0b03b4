//! One run: fetch, normalize, diff, enrich, persist, notify, record.
//!
//! The snapshot, new-jobs artifact and report are written before any mail
//! goes out. A crash while sending can lose notifications but never resend
//! them on the next run. A failed write is logged and flagged on the summary
//! rather than ending the run; without a snapshot, no mail goes out.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::diff::diff;
use crate::enrich::Enricher;
use crate::feed::{collect_board, FeedSource, FetchPlan};
use crate::ledger::StatsLedger;
use crate::normalize::normalize_board;
use crate::notify::{dispatch, DispatchReport, MailConnector};
use crate::subscribers::SubscriberStore;
use crate::{report, snapshot};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub pages_fetched: u32,
    pub jobs_on_board: usize,
    pub new_jobs: usize,
    pub enriched: usize,
    pub snapshot_written: bool,
    pub artifact_written: bool,
    pub report_written: bool,
    pub dispatch: Option<DispatchReport>,
    pub dispatch_error: Option<String>,
    pub ledger_recorded: bool,
}

pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub feed: &'a dyn FeedSource,
    pub plan: FetchPlan,
    pub enricher: &'a Enricher,
    pub subscribers: &'a dyn SubscriberStore,
    pub ledger: &'a dyn StatsLedger,
    /// `None` when mail credentials are not configured.
    pub mail: Option<&'a dyn MailConnector>,
}

impl Pipeline<'_> {
    pub fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let previous = snapshot::load(&self.config.jobs_file)?;

        info!("Fetching all job listings from job board...");
        let board = collect_board(self.feed, &self.plan);
        if board.is_unavailable() {
            bail!("Feed unavailable: first page failed after retries; snapshot left untouched");
        }
        if let Some(page) = board.failed_page {
            warn!("Page {} failed after retries; continuing with {} listings", page, board.listings.len());
        }

        let current = normalize_board(&board.listings);
        let mut outcome = diff(current, &previous, now);

        let enriched = self.enricher.enrich_missing(&mut outcome.merged);
        let new_jobs = outcome.new_jobs();

        if new_jobs.is_empty() {
            info!("No new jobs (scanned {} listings)", outcome.merged.len());
        } else {
            info!("{} new job(s) detected:", new_jobs.len());
            for job in &new_jobs {
                info!("  - {} - {}", job.company, job.position);
            }
        }

        let mut summary = RunSummary {
            pages_fetched: board.pages_fetched,
            jobs_on_board: outcome.merged.len(),
            new_jobs: new_jobs.len(),
            enriched,
            ..RunSummary::default()
        };

        summary.snapshot_written = match snapshot::save(&self.config.jobs_file, &outcome.merged) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save snapshot: {:#}", e);
                false
            }
        };

        summary.artifact_written = match snapshot::write_new_jobs(&self.config.new_jobs_file, &new_jobs) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write new-jobs artifact: {:#}", e);
                false
            }
        };
        summary.report_written = match report::write_report(&self.config.report_file, &outcome.merged, now) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write report: {:#}", e);
                false
            }
        };

        if !new_jobs.is_empty() && !summary.snapshot_written {
            // The same jobs will be new again next run; mailing now would repeat them.
            warn!("Snapshot not saved. Skipping notification.");
        } else if !new_jobs.is_empty() {
            match self.mail {
                None => warn!("Email credentials not found. Skipping notification."),
                Some(connector) => {
                    let subscribers = self.subscribers.list_active_confirmed().unwrap_or_else(|e| {
                        error!("Failed to load subscribers: {:#}", e);
                        Vec::new()
                    });
                    match dispatch(
                        &new_jobs,
                        &self.config.admin_recipients,
                        &subscribers,
                        self.config.app_url.as_deref(),
                        connector,
                    ) {
                        Ok(report) => summary.dispatch = Some(report),
                        Err(e) => {
                            error!("Failed to send email: {}", e);
                            summary.dispatch_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        let active_subscribers = self.subscribers.count_active_confirmed().unwrap_or_else(|e| {
            error!("Failed to count subscribers: {:#}", e);
            0
        });
        summary.ledger_recorded =
            self.ledger
                .record(summary.jobs_on_board, summary.new_jobs, active_subscribers);

        info!("Update complete!");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::enrich::tests::CannedProvider;
    use crate::feed::tests::{listing, ScriptedFeed};
    use crate::feed::{RawListing, RetryPolicy};
    use crate::ledger::SqliteStatsLedger;
    use crate::models::{JobRecord, Preference};
    use crate::notify::tests::RecordingMail;
    use crate::notify::{DispatchError, MailTransport};
    use crate::subscribers::SqliteSubscriberStore;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        config: Config,
        store: SqliteSubscriberStore,
        ledger: SqliteStatsLedger,
        _tmp: TempDir,
    }

    fn harness(extra: &[(&str, &str)]) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut vars: HashMap<String, String> = HashMap::new();
        let path = |name: &str| tmp.path().join(name).to_string_lossy().to_string();
        vars.insert("DATABASE_PATH".into(), path("board.db"));
        vars.insert("JOBS_FILE".into(), path("jobs.json"));
        vars.insert("NEW_JOBS_FILE".into(), path("new_jobs.json"));
        vars.insert("REPORT_FILE".into(), path("JOBS.md"));
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
        let db = Arc::new(Database::open(&config.database_path).unwrap());
        Harness {
            config,
            store: SqliteSubscriberStore::new(db.clone()),
            ledger: SqliteStatsLedger::new(db),
            _tmp: tmp,
        }
    }

    fn quick_plan() -> FetchPlan {
        FetchPlan {
            retry: RetryPolicy {
                retries: 2,
                delay: std::time::Duration::ZERO,
            },
            ..FetchPlan::default()
        }
    }

    fn listings(ids: &[usize]) -> Vec<RawListing> {
        ids.iter().copied().map(listing).collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 4, 18, 0, 0).unwrap()
    }

    fn run_with(
        h: &Harness,
        feed: &dyn FeedSource,
        enricher: &Enricher,
        mail: Option<&dyn MailConnector>,
        now: DateTime<Utc>,
    ) -> Result<RunSummary> {
        Pipeline {
            config: &h.config,
            feed,
            plan: quick_plan(),
            enricher,
            subscribers: &h.store,
            ledger: &h.ledger,
            mail,
        }
        .run(now)
    }

    fn saved(path: &PathBuf) -> Vec<JobRecord> {
        snapshot::load(path).unwrap()
    }

    #[test]
    fn test_first_and_second_run() {
        let h = harness(&[]);
        let enricher = Enricher::new(None, 1).unwrap();

        let feed = ScriptedFeed::new().page(1, listings(&[1, 2, 3]));
        let first = run_with(&h, &feed, &enricher, None, t0()).unwrap();
        assert_eq!(first.new_jobs, 3);
        assert!(first.ledger_recorded);
        assert!(saved(&h.config.jobs_file).iter().all(|j| j.discovered_at == Some(t0())));

        let later = t0() + Duration::hours(1);
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2, 3, 4]));
        let second = run_with(&h, &feed, &enricher, None, later).unwrap();
        assert_eq!(second.new_jobs, 1);

        let new_jobs: Vec<JobRecord> =
            serde_json::from_str(&fs::read_to_string(&h.config.new_jobs_file).unwrap()).unwrap();
        assert_eq!(new_jobs.len(), 1);
        assert_eq!(new_jobs[0].position, "Job 4");

        let board = saved(&h.config.jobs_file);
        assert_eq!(board.len(), 4);
        for job in board.iter().filter(|j| j.position != "Job 4") {
            assert_eq!(job.discovered_at, Some(t0()));
        }

        let history = h.ledger.history(10).unwrap();
        assert_eq!(history[1].total_jobs_ever, 3);
        assert_eq!(history[0].total_jobs_ever, 4);
    }

    #[test]
    fn test_unchanged_board_writes_empty_marker() {
        let h = harness(&[]);
        let enricher = Enricher::new(None, 1).unwrap();
        run_with(&h, &ScriptedFeed::new().page(1, listings(&[1])), &enricher, None, t0()).unwrap();
        let summary =
            run_with(&h, &ScriptedFeed::new().page(1, listings(&[1])), &enricher, None, t0()).unwrap();
        assert_eq!(summary.new_jobs, 0);
        assert_eq!(fs::metadata(&h.config.new_jobs_file).unwrap().len(), 0);
    }

    #[test]
    fn test_malformed_enrichment_still_completes() {
        let h = harness(&[]);
        let enricher =
            Enricher::new(Some(Box::new(CannedProvider::replying("I think it's an internship."))), 2)
                .unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2]));

        let summary = run_with(&h, &feed, &enricher, None, t0()).unwrap();
        assert_eq!(summary.enriched, 0);
        assert!(saved(&h.config.jobs_file).iter().all(|j| j.badges.is_none()));
        assert!(fs::read_to_string(&h.config.report_file).unwrap().contains("Job 1"));
    }

    #[test]
    fn test_badges_persist_and_backfill() {
        let h = harness(&[]);
        let disabled = Enricher::new(None, 1).unwrap();
        run_with(&h, &ScriptedFeed::new().page(1, listings(&[1])), &disabled, None, t0()).unwrap();

        let provider = CannedProvider::replying(r#"{"job_type": "full-time"}"#);
        let enricher = Enricher::new(Some(Box::new(provider)), 2).unwrap();
        let summary =
            run_with(&h, &ScriptedFeed::new().page(1, listings(&[1, 2])), &enricher, None, t0()).unwrap();
        // Job 1 backfilled, job 2 enriched as new.
        assert_eq!(summary.enriched, 2);

        let failing = Enricher::new(Some(Box::new(CannedProvider::failing("down"))), 1).unwrap();
        run_with(&h, &ScriptedFeed::new().page(1, listings(&[1, 2])), &failing, None, t0()).unwrap();
        assert!(saved(&h.config.jobs_file).iter().all(|j| j.badges.is_some()));
    }

    #[test]
    fn test_first_page_failure_leaves_snapshot() {
        let h = harness(&[]);
        let enricher = Enricher::new(None, 1).unwrap();
        run_with(&h, &ScriptedFeed::new().page(1, listings(&[1, 2])), &enricher, None, t0()).unwrap();
        let before = fs::read_to_string(&h.config.jobs_file).unwrap();

        let down = ScriptedFeed::new().failure(1).failure(1).failure(1);
        assert!(run_with(&h, &down, &enricher, None, t0()).is_err());
        assert_eq!(fs::read_to_string(&h.config.jobs_file).unwrap(), before);
        assert_eq!(h.ledger.history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_notifies_admins_and_confirmed_subscribers() {
        let h = harness(&[("EMAIL_RECIPIENTS", "admin@x.com"), ("APP_URL", "https://jobs.example.com")]);
        let confirmed = h.store.add("fan@x.com", Preference::Both);
        h.store.confirm(confirmed.token.as_deref().unwrap()).unwrap();
        h.store.add("pending@x.com", Preference::Both);

        let mail = RecordingMail::default();
        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2]));
        let summary = run_with(&h, &feed, &enricher, Some(&mail), t0()).unwrap();

        let report = summary.dispatch.unwrap();
        assert_eq!(report.admin_sent, 1);
        assert_eq!(report.subscriber_sent, 1);
        let recipients: Vec<String> = mail.sent.borrow().iter().map(|m| m.to.clone()).collect();
        assert_eq!(recipients, vec!["admin@x.com", "fan@x.com"]);

        assert_eq!(h.ledger.history(1).unwrap()[0].active_subscribers, 1);
    }

    #[test]
    fn test_transport_failure_does_not_fail_run() {
        let h = harness(&[("EMAIL_RECIPIENTS", "a@x.com,b@x.com")]);
        let mail = RecordingMail {
            fail_after: Some(0),
            ..RecordingMail::default()
        };
        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1]));

        let summary = run_with(&h, &feed, &enricher, Some(&mail), t0()).unwrap();
        assert!(summary.dispatch_error.is_some());
        assert!(summary.ledger_recorded);
        assert_eq!(saved(&h.config.jobs_file).len(), 1);

        // The jobs are no longer new, so nothing is resent.
        let retry = RecordingMail::default();
        let feed = ScriptedFeed::new().page(1, listings(&[1]));
        let summary = run_with(&h, &feed, &enricher, Some(&retry), t0()).unwrap();
        assert!(summary.dispatch.is_none());
        assert!(retry.sent.borrow().is_empty());
    }

    #[test]
    fn test_report_failure_does_not_stop_run() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the report's directory should be.
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let report_file = blocker.join("JOBS.md").to_string_lossy().to_string();
        let artifact = blocker.join("new_jobs.json").to_string_lossy().to_string();
        let h = harness(&[
            ("REPORT_FILE", report_file.as_str()),
            ("NEW_JOBS_FILE", artifact.as_str()),
            ("EMAIL_RECIPIENTS", "admin@x.com"),
        ]);

        let mail = RecordingMail::default();
        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2, 3]));
        let summary = run_with(&h, &feed, &enricher, Some(&mail), t0()).unwrap();

        assert!(summary.snapshot_written);
        assert!(!summary.report_written);
        assert!(!summary.artifact_written);
        assert_eq!(saved(&h.config.jobs_file).len(), 3);
        assert_eq!(summary.dispatch.unwrap().admin_sent, 1);
        assert!(summary.ledger_recorded);
        assert_eq!(h.ledger.history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_failure_skips_mail_but_records() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let jobs_file = blocker.join("jobs.json").to_string_lossy().to_string();
        let h = harness(&[("JOBS_FILE", jobs_file.as_str()), ("EMAIL_RECIPIENTS", "admin@x.com")]);

        let mail = RecordingMail::default();
        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2]));
        let summary = run_with(&h, &feed, &enricher, Some(&mail), t0()).unwrap();

        assert!(!summary.snapshot_written);
        assert!(summary.report_written);
        assert!(summary.dispatch.is_none());
        assert_eq!(mail.connects.get(), 0);
        assert!(summary.ledger_recorded);
    }

    #[test]
    fn test_report_directory_is_created() {
        let tmp = TempDir::new().unwrap();
        let report_file = tmp.path().join("site").join("JOBS.md");
        let report_arg = report_file.to_string_lossy().to_string();
        let h = harness(&[("REPORT_FILE", report_arg.as_str())]);

        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1]));
        let summary = run_with(&h, &feed, &enricher, None, t0()).unwrap();
        assert!(summary.report_written);
        assert!(summary.artifact_written);
        assert!(fs::read_to_string(&report_file).unwrap().contains("Job 1"));
    }

    /// Refuses to connect unless the snapshot already holds the new jobs.
    struct SnapshotCheckingMail {
        jobs_file: PathBuf,
        expected: usize,
    }

    impl MailConnector for SnapshotCheckingMail {
        fn connect(&self) -> Result<Box<dyn MailTransport>, DispatchError> {
            let on_disk = snapshot::load(&self.jobs_file).map(|jobs| jobs.len()).unwrap_or(0);
            if on_disk != self.expected {
                return Err(DispatchError::Connect("snapshot not written yet".to_string()));
            }
            RecordingMail::default().connect()
        }
    }

    #[test]
    fn test_snapshot_written_before_dispatch() {
        let h = harness(&[("EMAIL_RECIPIENTS", "admin@x.com")]);
        let mail = SnapshotCheckingMail {
            jobs_file: h.config.jobs_file.clone(),
            expected: 2,
        };
        let enricher = Enricher::new(None, 1).unwrap();
        let feed = ScriptedFeed::new().page(1, listings(&[1, 2]));
        let summary = run_with(&h, &feed, &enricher, Some(&mail), t0()).unwrap();
        assert!(summary.dispatch_error.is_none());
        assert_eq!(summary.dispatch.unwrap().admin_sent, 1);
    }
}
