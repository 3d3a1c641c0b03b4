//! Per-recipient notification fan-out over one SMTP session.

use html_escape::{encode_double_quoted_attribute, encode_text};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{Message, SmtpTransport, Transport};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MailSettings;
use crate::models::{BadgeSet, JobRecord, Preference, Subscriber};

const PILL_STYLE: &str = "display:inline-block;padding:2px 8px;border-radius:12px;\
font-size:11px;font-weight:600;margin:2px;";
const BUTTON_STYLE: &str = "display: inline-block; background-color: #13294b; color: #fff; \
padding: 10px 20px; border-radius: 6px; text-decoration: none; font-weight: bold;";

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    /// This recipient only; the session is still usable.
    #[error("recipient {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },

    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not open mail session: {0}")]
    Connect(String),

    #[error("mail transport failed after {delivered} message(s): {reason}")]
    Transport { delivered: usize, reason: String },
}

pub trait MailTransport {
    fn send(&self, message: &OutgoingMessage) -> Result<(), SendError>;
}

/// Opens a session lazily, only once there is something to send.
pub trait MailConnector {
    fn connect(&self) -> Result<Box<dyn MailTransport>, DispatchError>;
}

// --- SMTP ---

pub struct SmtpConnector {
    settings: MailSettings,
}

impl SmtpConnector {
    pub fn new(settings: MailSettings) -> Self {
        Self { settings }
    }
}

impl MailConnector for SmtpConnector {
    fn connect(&self) -> Result<Box<dyn MailTransport>, DispatchError> {
        let mailer = SmtpMailer::connect(&self.settings)?;
        Ok(Box::new(mailer))
    }
}

pub struct SmtpMailer {
    from: Mailbox,
    transport: SmtpTransport,
}

impl SmtpMailer {
    /// Builds a single-connection transport and verifies it before use.
    pub fn connect(settings: &MailSettings) -> Result<Self, DispatchError> {
        let from: Mailbox = settings
            .sender
            .parse()
            .map_err(|e| DispatchError::Connect(format!("invalid sender address: {}", e)))?;

        // 465 is implicit TLS; anything else negotiates STARTTLS.
        let builder = if settings.port == 465 {
            SmtpTransport::relay(&settings.host)
        } else {
            SmtpTransport::starttls_relay(&settings.host)
        }
        .map_err(|e| DispatchError::Connect(e.to_string()))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(
                settings.sender.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(settings.timeout))
            .pool_config(PoolConfig::new().max_size(1))
            .build();

        info!("Connecting to SMTP server {}:{}", settings.host, settings.port);
        match transport.test_connection() {
            Ok(true) => Ok(Self { from, transport }),
            Ok(false) => Err(DispatchError::Connect(format!(
                "{} did not accept the connection",
                settings.host
            ))),
            Err(e) => Err(DispatchError::Connect(e.to_string())),
        }
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        let rejected = |reason: String| SendError::Rejected {
            recipient: message.to.clone(),
            reason,
        };
        let to: Mailbox = message.to.parse().map_err(|e| rejected(format!("{}", e)))?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(message.html.clone())
            .map_err(|e| rejected(e.to_string()))?;

        match self.transport.send(&email) {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(rejected(e.to_string())),
            Err(e) => Err(SendError::Transport(e.to_string())),
        }
    }
}

// --- Content ---

pub fn is_internship(job: &JobRecord) -> bool {
    job.position.to_lowercase().contains("intern")
}

pub fn filter_by_preference(jobs: &[JobRecord], preference: Preference) -> Vec<JobRecord> {
    jobs.iter()
        .filter(|job| match preference {
            Preference::Both => true,
            Preference::Internship => is_internship(job),
            Preference::Fulltime => !is_internship(job),
        })
        .cloned()
        .collect()
}

pub fn subject_line(count: usize) -> String {
    format!(
        "🎓 {} New Research Park Job{} Found!",
        count,
        if count == 1 { "" } else { "s" }
    )
}

pub fn unsubscribe_url(app_url: Option<&str>, token: &str) -> Option<String> {
    app_url.map(|base| format!("{}/unsubscribe?token={}", base, token))
}

fn pill(text: &str, background: &str, color: &str) -> String {
    format!(
        r#"<span style="{}background:{};color:{};">{}</span>"#,
        PILL_STYLE,
        background,
        color,
        encode_text(text)
    )
}

pub fn badge_pills(badges: Option<&BadgeSet>) -> String {
    let Some(badges) = badges else {
        return String::new();
    };

    let mut pills = Vec::new();
    if let Some(job_type) = badges.job_type {
        pills.push(pill(job_type.label(), "#dbeafe", "#1e40af"));
    }
    if let Some(gpa) = &badges.min_gpa {
        pills.push(pill(&format!("GPA {}+", gpa), "#fef3c7", "#92400e"));
    }
    for year in &badges.class_years {
        pills.push(pill(year, "#e0f2fe", "#075985"));
    }
    if badges.cpt_opt_required {
        pills.push(pill("CPT/OPT Required", "#fce7f3", "#9d174d"));
    }
    if let Some(mode) = badges.work_mode {
        pills.push(pill(mode.label(), "#f3e8ff", "#6b21a8"));
    }
    if let Some(duration) = &badges.duration {
        pills.push(pill(duration, "#dcfce7", "#166534"));
    }
    for major in &badges.majors {
        pills.push(pill(major, "#f3f4f6", "#374151"));
    }

    if pills.is_empty() {
        return String::new();
    }
    format!(r#"<div style="margin-top:4px;">{}</div>"#, pills.concat())
}

fn board_button(app_url: Option<&str>) -> String {
    match app_url {
        Some(url) => format!(
            r#"<p><a href="{}" style="{}">View the Job Board</a></p>"#,
            encode_double_quoted_attribute(url),
            BUTTON_STYLE
        ),
        None => String::new(),
    }
}

fn unsubscribe_footer(link: Option<&str>) -> String {
    match link {
        Some(link) => format!(
            r#"<p style="color: #999; font-size: 11px;"><a href="{}" style="color: #999;">Unsubscribe from these notifications</a></p>"#,
            encode_double_quoted_attribute(link)
        ),
        None => String::new(),
    }
}

pub fn render_html(jobs: &[JobRecord], app_url: Option<&str>, unsubscribe_link: Option<&str>) -> String {
    let plural = jobs.len() != 1;
    let mut html = String::new();
    html.push_str(r#"<html><body style="font-family: Arial, sans-serif; line-height: 1.6;">"#);
    html.push_str(&format!(
        r#"<h2 style="color: #13294b;">New Job Posting{} at Research Park</h2>"#,
        if plural { "s" } else { "" }
    ));
    html.push_str(&format!(
        "<p>The following new position{} just detected:</p>",
        if plural { "s were" } else { " was" }
    ));
    html.push_str(r#"<ul style="list-style-type: none; padding: 0;">"#);
    for job in jobs {
        html.push_str(&format!(
            r#"<li style="margin-bottom: 15px; border-left: 4px solid #E84A27; padding-left: 10px;"><strong>{}</strong><br>{}{}</li>"#,
            encode_text(&job.company),
            encode_text(&job.position),
            badge_pills(job.badges.as_ref())
        ));
    }
    html.push_str("</ul>");
    html.push_str(&board_button(app_url));
    html.push_str(
        r#"<p style="color: #666; font-size: 12px; margin-top: 30px;">This is an automated notification from your Research Park Job Monitor.</p>"#,
    );
    html.push_str(&unsubscribe_footer(unsubscribe_link));
    html.push_str("</body></html>");
    html
}

/// Sent by `subscribe` so the address owner can confirm.
pub fn confirmation_message(recipient: &str, token: &str, app_url: Option<&str>) -> OutgoingMessage {
    let confirm = match app_url {
        Some(base) => {
            let link = format!("{}/confirm?token={}", base, token);
            format!(
                r#"<p><a href="{}" style="{}">Confirm my subscription</a></p>"#,
                encode_double_quoted_attribute(&link),
                BUTTON_STYLE
            )
        }
        None => format!(
            "<p>Confirm with this token: <code>{}</code></p>",
            encode_text(token)
        ),
    };
    let unsubscribe = unsubscribe_url(app_url, token);

    let html = format!(
        concat!(
            r#"<html><body style="font-family: Arial, sans-serif; line-height: 1.6;">"#,
            r#"<h2 style="color: #13294b;">Welcome to Research Park Job Alerts!</h2>"#,
            "<p>Please confirm your address to start receiving notifications when new jobs are posted at the UIUC Research Park.</p>",
            "{}{}",
            "</body></html>"
        ),
        confirm,
        unsubscribe_footer(unsubscribe.as_deref())
    );

    OutgoingMessage {
        to: recipient.to_string(),
        subject: "Confirm your Research Park Job Alerts subscription".to_string(),
        html,
    }
}

// --- Dispatch ---

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub admin_sent: usize,
    pub subscriber_sent: usize,
    /// Subscribers skipped because they already get the admin copy.
    pub admin_overlap: usize,
    /// Subscribers with nothing matching their preference.
    pub suppressed: usize,
    pub rejected: usize,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.admin_sent + self.subscriber_sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecipientClass {
    Admin,
    Subscriber,
}

/// Messages for one dispatch, admins first. Counts skipped subscribers into
/// `report`.
fn plan_messages(
    new_jobs: &[JobRecord],
    admin_recipients: &[String],
    subscribers: &[Subscriber],
    app_url: Option<&str>,
    report: &mut DispatchReport,
) -> Vec<(RecipientClass, OutgoingMessage)> {
    let mut planned = Vec::new();

    let admin_html = render_html(new_jobs, app_url, None);
    for admin in admin_recipients {
        planned.push((
            RecipientClass::Admin,
            OutgoingMessage {
                to: admin.clone(),
                subject: subject_line(new_jobs.len()),
                html: admin_html.clone(),
            },
        ));
    }

    let admins: HashSet<String> = admin_recipients.iter().map(|a| a.to_lowercase()).collect();
    for subscriber in subscribers {
        if admins.contains(&subscriber.email.to_lowercase()) {
            report.admin_overlap += 1;
            continue;
        }
        let filtered = filter_by_preference(new_jobs, subscriber.preference);
        if filtered.is_empty() {
            info!(
                "Skipping {}: no jobs match preference '{}'",
                subscriber.email,
                subscriber.preference.as_str()
            );
            report.suppressed += 1;
            continue;
        }
        let unsubscribe = unsubscribe_url(app_url, &subscriber.unsubscribe_token);
        planned.push((
            RecipientClass::Subscriber,
            OutgoingMessage {
                to: subscriber.email.clone(),
                subject: subject_line(filtered.len()),
                html: render_html(&filtered, app_url, unsubscribe.as_deref()),
            },
        ));
    }

    planned
}

/// Sends `new_jobs` to admins (everything) and subscribers (their preference).
///
/// A rejected recipient is skipped; a transport failure stops the dispatch and
/// reports how many messages had already gone out.
pub fn dispatch(
    new_jobs: &[JobRecord],
    admin_recipients: &[String],
    subscribers: &[Subscriber],
    app_url: Option<&str>,
    connector: &dyn MailConnector,
) -> Result<DispatchReport, DispatchError> {
    let mut report = DispatchReport::default();
    if new_jobs.is_empty() {
        return Ok(report);
    }
    if admin_recipients.is_empty() && subscribers.is_empty() {
        warn!("No recipients found. Skipping notification.");
        return Ok(report);
    }

    let planned = plan_messages(new_jobs, admin_recipients, subscribers, app_url, &mut report);
    if planned.is_empty() {
        info!("No recipient has matching jobs; nothing to send");
        return Ok(report);
    }

    let transport = connector.connect()?;
    for (class, message) in &planned {
        match transport.send(message) {
            Ok(()) => match class {
                RecipientClass::Admin => report.admin_sent += 1,
                RecipientClass::Subscriber => report.subscriber_sent += 1,
            },
            Err(SendError::Rejected { recipient, reason }) => {
                warn!("Skipping {}: {}", recipient, reason);
                report.rejected += 1;
            }
            Err(SendError::Transport(reason)) => {
                return Err(DispatchError::Transport {
                    delivered: report.delivered(),
                    reason,
                });
            }
        }
    }

    info!("Email notification sent to {} recipient(s)", report.delivered());
    Ok(report)
}

fn sample_job(id: &str, company: &str, position: &str) -> JobRecord {
    JobRecord {
        id: id.to_string(),
        company: company.to_string(),
        position: position.to_string(),
        link: String::new(),
        posted_at_raw: String::new(),
        posted_at_parsed: None,
        discovered_at: None,
        badges: None,
        raw_description: String::new(),
    }
}

/// Fixture batch with one internship and one full-time listing, so each
/// preference receives something.
pub fn sample_jobs() -> Vec<JobRecord> {
    vec![
        sample_job("sample-intern", "Acme Corp", "Software Engineering Intern - Summer 2026"),
        sample_job("sample-fulltime", "TechStart Inc", "Senior Data Scientist"),
    ]
}

/// Sends the sample batch to subscribers only. Exercises SMTP credentials and
/// preference fan-out without waiting for a real listing.
pub fn send_test_notification(
    subscribers: &[Subscriber],
    app_url: Option<&str>,
    connector: &dyn MailConnector,
) -> Result<DispatchReport, DispatchError> {
    info!("Sending test notification to {} subscriber(s)", subscribers.len());
    dispatch(&sample_jobs(), &[], subscribers, app_url, connector)
}
