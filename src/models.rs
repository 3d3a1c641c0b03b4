use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub company: String,
    pub position: String,
    pub link: String,
    #[serde(default)]
    pub posted_at_raw: String, // upstream pubDate, verbatim
    #[serde(default)]
    pub posted_at_parsed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub badges: Option<BadgeSet>,
    #[serde(skip)]
    pub raw_description: String, // only read by enrichment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "internship")]
    Internship,
    #[serde(rename = "full-time")]
    FullTime,
    #[serde(rename = "part-time")]
    PartTime,
}

impl JobType {
    pub fn label(&self) -> &'static str {
        match self {
            JobType::Internship => "Internship",
            JobType::FullTime => "Full-time",
            JobType::PartTime => "Part-time",
        }
    }
}

impl FromStr for JobType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internship" | "intern" => Ok(JobType::Internship),
            "full-time" | "fulltime" | "full time" => Ok(JobType::FullTime),
            "part-time" | "parttime" | "part time" => Ok(JobType::PartTime),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkMode {
    #[serde(rename = "in-person")]
    InPerson,
    #[serde(rename = "remote")]
    Remote,
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl WorkMode {
    pub fn label(&self) -> &'static str {
        match self {
            WorkMode::InPerson => "In-person",
            WorkMode::Remote => "Remote",
            WorkMode::Hybrid => "Hybrid",
        }
    }
}

impl FromStr for WorkMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in-person" | "in person" | "onsite" | "on-site" => Ok(WorkMode::InPerson),
            "remote" => Ok(WorkMode::Remote),
            "hybrid" => Ok(WorkMode::Hybrid),
            _ => Err(()),
        }
    }
}

/// Structured metadata extracted from a listing description.
///
/// Every field is optional on the wire. A provider that returns an unknown
/// enum label or the wrong JSON type for one field loses that field only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadgeSet {
    #[serde(default, deserialize_with = "lenient_enum")]
    pub job_type: Option<JobType>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub min_gpa: Option<String>,
    /// `Some(true)` sponsors, `Some(false)` explicitly does not, `None` unspecified.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub visa_sponsorship: Option<bool>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub cpt_opt_required: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub uiuc_only: bool,
    #[serde(default, deserialize_with = "lenient_list")]
    pub class_years: Vec<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub majors: Vec<String>,
    #[serde(default, deserialize_with = "lenient_enum")]
    pub work_mode: Option<WorkMode>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub duration: Option<String>,
}

fn lenient_enum<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok()))
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(serde_json::Value::as_bool))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_bool(deserializer)?.unwrap_or(false))
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let mut items: Vec<String> = match value {
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    // Set semantics, first occurrence keeps its position.
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.to_lowercase()));
    Ok(items)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    Internship,
    Fulltime,
    #[default]
    Both,
}

impl Preference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preference::Internship => "internship",
            Preference::Fulltime => "fulltime",
            Preference::Both => "both",
        }
    }

    /// Unknown or missing values fall back to `Both`.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("internship") => Preference::Internship,
            Some("fulltime") => Preference::Fulltime,
            _ => Preference::Both,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub email: String,
    pub unsubscribe_token: String,
    pub preference: Preference,
    pub active: bool,
    pub confirmed: bool,
    pub subscribed_at: String,
}

/// Result of a subscribe request, shaped for the web layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub ok: bool,
    pub message: String,
    pub token: Option<String>,
    pub needs_confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub id: i64,
    pub recorded_at: String,
    pub jobs_on_board: i64,
    pub new_jobs_found: i64,
    pub active_subscribers: i64,
    pub total_jobs_ever: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badges_parse_full_schema() {
        let raw = r#"{
            "min_gpa": "3.0",
            "visa_sponsorship": false,
            "cpt_opt_required": true,
            "uiuc_only": false,
            "class_years": ["Junior", "Senior"],
            "majors": ["Computer Science"],
            "job_type": "internship",
            "work_mode": "hybrid",
            "duration": "Summer 2026"
        }"#;
        let badges: BadgeSet = serde_json::from_str(raw).unwrap();
        assert_eq!(badges.job_type, Some(JobType::Internship));
        assert_eq!(badges.min_gpa.as_deref(), Some("3.0"));
        assert_eq!(badges.visa_sponsorship, Some(false));
        assert!(badges.cpt_opt_required);
        assert_eq!(badges.class_years, vec!["Junior", "Senior"]);
        assert_eq!(badges.work_mode, Some(WorkMode::Hybrid));
        assert_eq!(badges.duration.as_deref(), Some("Summer 2026"));
    }

    #[test]
    fn test_badges_absent_fields_are_not_errors() {
        let badges: BadgeSet = serde_json::from_str("{}").unwrap();
        assert_eq!(badges, BadgeSet::default());

        let badges: BadgeSet =
            serde_json::from_str(r#"{"min_gpa": null, "visa_sponsorship": null, "work_mode": null}"#)
                .unwrap();
        assert!(badges.min_gpa.is_none());
        assert!(badges.visa_sponsorship.is_none());
        assert!(badges.work_mode.is_none());
    }

    #[test]
    fn test_badges_tolerate_unexpected_values() {
        let raw = r#"{
            "job_type": "apprenticeship",
            "min_gpa": 3.5,
            "visa_sponsorship": "maybe",
            "cpt_opt_required": "yes",
            "class_years": "Senior",
            "majors": ["CS", "cs", ""]
        }"#;
        let badges: BadgeSet = serde_json::from_str(raw).unwrap();
        assert!(badges.job_type.is_none());
        assert_eq!(badges.min_gpa.as_deref(), Some("3.5"));
        assert!(badges.visa_sponsorship.is_none());
        assert!(!badges.cpt_opt_required);
        assert!(badges.class_years.is_empty());
        assert_eq!(badges.majors, vec!["CS"]);
    }

    #[test]
    fn test_job_record_skips_description_on_serialize() {
        let job = JobRecord {
            id: "guid-1".to_string(),
            company: "Acme".to_string(),
            position: "Intern".to_string(),
            link: "https://example.com/1".to_string(),
            posted_at_raw: String::new(),
            posted_at_parsed: None,
            discovered_at: None,
            badges: None,
            raw_description: "<p>secret</p>".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(!json.contains("secret"));

        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert!(back.raw_description.is_empty());
        assert_eq!(back.id, "guid-1");
    }

    #[test]
    fn test_preference_from_stored() {
        assert_eq!(Preference::from_stored(Some("internship")), Preference::Internship);
        assert_eq!(Preference::from_stored(Some("fulltime")), Preference::Fulltime);
        assert_eq!(Preference::from_stored(Some("weekly")), Preference::Both);
        assert_eq!(Preference::from_stored(None), Preference::Both);
    }
}
