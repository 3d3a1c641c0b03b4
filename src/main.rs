mod cache;
mod config;
mod db;
mod diff;
mod enrich;
mod feed;
mod ledger;
mod models;
mod normalize;
mod notify;
mod pipeline;
mod report;
mod snapshot;
mod subscribers;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{TtlCache, BOARD_CACHE_TTL};
use config::Config;
use db::Database;
use enrich::Enricher;
use feed::{FetchPlan, HttpFeedSource};
use ledger::{SqliteStatsLedger, StatsLedger, DEFAULT_HISTORY_LIMIT};
use models::{JobRecord, Preference};
use notify::{MailConnector, MailTransport, SmtpConnector, SmtpMailer};
use pipeline::Pipeline;
use subscribers::{validate_email, SqliteSubscriberStore, SubscriberStore};

#[derive(Parser)]
#[command(name = "boardwatch")]
#[command(about = "Watch the Research Park job feed and notify subscribers of new listings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Fetch the feed, detect new jobs, write artifacts and send notifications
    Run,

    /// Subscribe an address (sends a confirmation email when mail is configured)
    Subscribe {
        /// Email address
        email: String,

        /// Which jobs to receive
        #[arg(short, long, value_enum, default_value_t = Preference::Both)]
        preference: Preference,
    },

    /// Confirm a pending subscription
    Confirm {
        /// Token from the confirmation email
        token: String,
    },

    /// Stop notifications for a subscriber
    Unsubscribe {
        /// Token from the unsubscribe link
        token: String,
    },

    /// List active, confirmed subscribers
    Subscribers,

    /// Permanently delete a subscriber (admin)
    RemoveSubscriber {
        /// Email address
        email: String,

        #[arg(long)]
        admin_key: Option<String>,
    },

    /// Show per-run statistics (admin)
    Stats {
        /// Number of entries to show
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,

        #[arg(long)]
        admin_key: Option<String>,
    },

    /// Send a sample two-job notification to every confirmed subscriber (admin)
    TestNotification {
        #[arg(long)]
        admin_key: Option<String>,
    },

    /// Show the current board
    Board {
        /// Number of jobs to show
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

fn main() -> Result<()> {
    // A missing .env is normal in CI.
    dotenvy::dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Init => {
            let db = Database::open(&config.database_path)?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Run => {
            let db = Arc::new(Database::open(&config.database_path)?);
            let store = SqliteSubscriberStore::new(db.clone());
            let ledger = SqliteStatsLedger::new(db);
            let feed = HttpFeedSource::new(&config.feed_url)?;
            let enricher =
                Enricher::from_api_key(config.anthropic_api_key.as_deref(), config.enrich_concurrency)?;
            let connector = config.mail.clone().map(SmtpConnector::new);

            let summary = Pipeline {
                config: &config,
                feed: &feed,
                plan: FetchPlan::default(),
                enricher: &enricher,
                subscribers: &store,
                ledger: &ledger,
                mail: connector.as_ref().map(|c| c as &dyn MailConnector),
            }
            .run(Utc::now())?;

            println!(
                "Scanned {} page(s): {} jobs on board, {} new, {} enriched",
                summary.pages_fetched, summary.jobs_on_board, summary.new_jobs, summary.enriched
            );
            for (written, what) in [
                (summary.snapshot_written, "snapshot"),
                (summary.artifact_written, "new-jobs artifact"),
                (summary.report_written, "report"),
            ] {
                if !written {
                    println!("Failed to write {}; see log", what);
                }
            }
            if let Some(report) = &summary.dispatch {
                println!(
                    "Notified {} admin(s) and {} subscriber(s)",
                    report.admin_sent, report.subscriber_sent
                );
            }
            if let Some(err) = &summary.dispatch_error {
                println!("Notification failed: {}", err);
            }
        }

        Commands::Subscribe { email, preference } => {
            let email = validate_email(&email)?;
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            let outcome = store.add(&email, preference);
            if !outcome.ok {
                return Err(anyhow!(outcome.message));
            }
            println!("{}", outcome.message);

            if let (true, Some(token)) = (outcome.needs_confirm, outcome.token.as_deref()) {
                match &config.mail {
                    Some(settings) => {
                        let message =
                            notify::confirmation_message(&email, token, config.app_url.as_deref());
                        let sent = SmtpMailer::connect(settings)
                            .map_err(|e| anyhow!(e.to_string()))
                            .and_then(|mailer| mailer.send(&message).map_err(|e| anyhow!(e.to_string())));
                        match sent {
                            Ok(()) => info!("Confirmation email sent to {}", email),
                            Err(e) => warn!("Failed to send confirmation email to {}: {}", email, e),
                        }
                    }
                    None => {
                        warn!("Email credentials not found; confirmation email not sent");
                        println!("Confirm with: boardwatch confirm {}", token);
                    }
                }
            }
        }

        Commands::Confirm { token } => {
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            if store.confirm(&token)? {
                println!("Subscription confirmed.");
            } else {
                println!("Invalid or already used confirmation token.");
            }
        }

        Commands::Unsubscribe { token } => {
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            if store.remove(&token)? {
                println!("You have been unsubscribed.");
            } else {
                println!("Subscription not found or already removed.");
            }
        }

        Commands::Subscribers => {
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            let subs = store.list_active_confirmed()?;
            if subs.is_empty() {
                println!("No active subscribers.");
            } else {
                println!("{:<40} {:<12} {:<20}", "EMAIL", "PREFERENCE", "SUBSCRIBED");
                println!("{}", "-".repeat(74));
                for sub in &subs {
                    println!(
                        "{:<40} {:<12} {:<20}",
                        truncate(&sub.email, 38),
                        sub.preference.as_str(),
                        sub.subscribed_at
                    );
                }
            }
        }

        Commands::RemoveSubscriber { email, admin_key } => {
            config.require_admin(admin_key.as_deref())?;
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            if store.delete_by_email(&email)? {
                println!("Removed {}", email.trim().to_lowercase());
            } else {
                println!("Subscriber not found");
            }
        }

        Commands::Stats { limit, admin_key } => {
            config.require_admin(admin_key.as_deref())?;
            let ledger = SqliteStatsLedger::new(Arc::new(Database::open(&config.database_path)?));
            let history = ledger.history(limit)?;
            if history.is_empty() {
                println!("No runs recorded yet.");
            } else {
                println!(
                    "{:<20} {:>8} {:>6} {:>6} {:>10}",
                    "RECORDED", "BOARD", "NEW", "SUBS", "TOTAL EVER"
                );
                println!("{}", "-".repeat(54));
                for entry in &history {
                    println!(
                        "{:<20} {:>8} {:>6} {:>6} {:>10}",
                        entry.recorded_at,
                        entry.jobs_on_board,
                        entry.new_jobs_found,
                        entry.active_subscribers,
                        entry.total_jobs_ever
                    );
                }
            }
        }

        Commands::TestNotification { admin_key } => {
            config.require_admin(admin_key.as_deref())?;
            let settings = config.mail.clone().ok_or_else(|| anyhow!("Email credentials not set"))?;
            let store = SqliteSubscriberStore::new(Arc::new(Database::open(&config.database_path)?));
            let subs = store.list_active_confirmed()?;
            if subs.is_empty() {
                return Err(anyhow!("No subscribers found"));
            }

            let connector = SmtpConnector::new(settings);
            let report = notify::send_test_notification(&subs, config.app_url.as_deref(), &connector)
                .map_err(|e| anyhow!(e.to_string()))?;
            println!(
                "Test notification sent to {} of {} subscriber(s) ({} with no matching jobs, {} rejected)",
                report.subscriber_sent,
                subs.len(),
                report.suppressed,
                report.rejected
            );
        }

        Commands::Board { limit } => {
            let cache: TtlCache<Vec<JobRecord>> = TtlCache::new(BOARD_CACHE_TTL);
            let mut jobs = cache.get_or_refresh(|| match &config.board_url {
                Some(url) => snapshot::fetch_published(url),
                None => snapshot::load(&config.jobs_file),
            })?;
            diff::sort_by_recency(&mut jobs);

            if jobs.is_empty() {
                println!("No jobs on the board.");
            } else {
                println!("{:<25} {:<40} {:<26}", "COMPANY", "POSITION", "POSTED");
                println!("{}", "-".repeat(93));
                for job in jobs.iter().take(limit.unwrap_or(jobs.len())) {
                    println!(
                        "{:<25} {:<40} {:<26}",
                        truncate(&job.company, 23),
                        truncate(&job.position, 38),
                        report::format_posted(job)
                    );
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
