//! API-friendly (decrypted) views of ballots, and the request types the core accepts.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::common::{BallotId, OptionId};

pub const MIN_MEASURE_LEN: usize = 3;
pub const MAX_MEASURE_LEN: usize = 255;
pub const MAX_OPTION_LEN: usize = 64;

/// A request to create a new ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotSpec {
    pub measure: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_write_in: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl BallotSpec {
    /// Check the spec is well-formed, returning it with surrounding whitespace trimmed.
    pub fn validated(self) -> Result<Self> {
        let measure = self.measure.trim().to_string();
        let measure_len = measure.chars().count();
        if !(MIN_MEASURE_LEN..=MAX_MEASURE_LEN).contains(&measure_len) {
            return Err(Error::BadRequest(format!(
                "measure must be between {MIN_MEASURE_LEN} and {MAX_MEASURE_LEN} characters"
            )));
        }

        let options: Vec<String> = self
            .options
            .iter()
            .map(|option| option.trim().to_string())
            .filter(|option| !option.is_empty())
            .collect();
        // Without write-ins there must be an actual choice to make.
        let min_options = if self.allow_write_in { 1 } else { 2 };
        if options.len() < min_options {
            return Err(Error::BadRequest(format!(
                "at least {min_options} options are required when write-ins are {}",
                if self.allow_write_in { "enabled" } else { "disabled" }
            )));
        }
        if let Some(long) = options
            .iter()
            .find(|option| option.chars().count() > MAX_OPTION_LEN)
        {
            return Err(Error::BadRequest(format!(
                "option '{long}' is longer than {MAX_OPTION_LEN} characters"
            )));
        }
        let mut seen = HashSet::new();
        for option in &options {
            if !seen.insert(option.as_str()) {
                return Err(Error::BadRequest(format!(
                    "option '{option}' appears more than once"
                )));
            }
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(Error::BadRequest(
                    "start time must not be after end time".to_string(),
                ));
            }
        }

        Ok(Self {
            measure,
            options,
            allow_write_in: self.allow_write_in,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

/// A vote as submitted by a voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// A vote for an existing option.
    Option(OptionId),
    /// A vote for free text, which becomes an option the first time it is seen.
    WriteIn(String),
}

/// Aggregated vote count for one option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub option: String,
    pub count: u64,
}

impl Tally {
    pub fn new(option: impl Into<String>, count: u64) -> Self {
        Self {
            option: option.into(),
            count,
        }
    }

    /// Total votes across a snapshot. Votes on a ballot are serialized, so a
    /// larger total always means a newer snapshot.
    pub fn total(tallies: &[Tally]) -> u64 {
        tallies.iter().map(|t| t.count).sum()
    }
}

/// A decrypted ballot option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotOption {
    pub id: OptionId,
    pub text: String,
    pub is_write_in: bool,
}

/// A decrypted ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub id: BallotId,
    pub owner_id: Option<String>,
    pub measure: String,
    pub allow_write_in: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub options: Vec<BallotOption>,
}

impl Ballot {
    /// Find an option by its exact text.
    pub fn option_by_text(&self, text: &str) -> Option<&BallotOption> {
        self.options.iter().find(|option| option.text == text)
    }

    pub fn status(&self) -> BallotStatus {
        BallotStatus::at(self.start_time, self.end_time, Utc::now())
    }
}

/// Where a ballot is in its voting window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotStatus {
    Pending,
    Active,
    Ended,
}

impl BallotStatus {
    /// Derive the status at time `now`. The window is `[start_time, end_time)`.
    pub fn at(
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        match (start_time, end_time) {
            (Some(start), _) if now < start => Self::Pending,
            (_, Some(end)) if now >= end => Self::Ended,
            _ => Self::Active,
        }
    }
}

/// A human-readable description of a ballot's status, e.g. "ends in 2 hours".
pub fn describe_status(
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    match (BallotStatus::at(start_time, end_time, now), start_time, end_time) {
        (BallotStatus::Pending, Some(start), _) => {
            format!("starts in {}", format_time_delta(start - now))
        }
        (BallotStatus::Ended, _, _) => "voting closed".to_string(),
        (_, _, Some(end)) => format!("ends in {}", format_time_delta(end - now)),
        _ => "voting open".to_string(),
    }
}

/// Format a duration at the coarsest whole unit, e.g. "2 hours".
pub fn format_time_delta(delta: Duration) -> String {
    let seconds = delta.num_seconds();
    if seconds < 60 {
        return format!("{seconds} seconds");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes} minutes");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours} hours");
    }
    format!("{} days", hours / 24)
}

/// Summary of a ballot, as listed on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotSummary {
    pub id: BallotId,
    pub measure: String,
    pub status: BallotStatus,
    pub status_text: String,
}

impl From<&Ballot> for BallotSummary {
    fn from(ballot: &Ballot) -> Self {
        let now = Utc::now();
        Self {
            id: ballot.id.clone(),
            measure: ballot.measure.clone(),
            status: BallotStatus::at(ballot.start_time, ballot.end_time, now),
            status_text: describe_status(ballot.start_time, ballot.end_time, now),
        }
    }
}

/// Full description of a ballot, including its options and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotDescription {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub status: BallotStatus,
    pub status_text: String,
}

impl From<Ballot> for BallotDescription {
    fn from(ballot: Ballot) -> Self {
        let now = Utc::now();
        let status = BallotStatus::at(ballot.start_time, ballot.end_time, now);
        let status_text = describe_status(ballot.start_time, ballot.end_time, now);
        Self {
            ballot,
            status,
            status_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use rocket::serde::json::serde_json;

    use super::*;

    impl BallotSpec {
        pub fn yes_no() -> Self {
            Self {
                measure: "Should we adopt the proposal?".to_string(),
                options: vec!["Yes".to_string(), "No".to_string()],
                allow_write_in: false,
                start_time: None,
                end_time: None,
            }
        }

        pub fn with_write_ins() -> Self {
            Self {
                measure: "Who should chair the next meeting?".to_string(),
                options: vec!["Alice".to_string()],
                allow_write_in: true,
                start_time: None,
                end_time: None,
            }
        }
    }

    #[test]
    fn format_time_delta_units() {
        assert_eq!(format_time_delta(Duration::seconds(45)), "45 seconds");
        assert_eq!(format_time_delta(Duration::minutes(5)), "5 minutes");
        assert_eq!(format_time_delta(Duration::seconds(119)), "1 minutes");
        assert_eq!(format_time_delta(Duration::hours(3)), "3 hours");
        assert_eq!(format_time_delta(Duration::minutes(119)), "1 hours");
        assert_eq!(format_time_delta(Duration::days(2)), "2 days");
        assert_eq!(format_time_delta(Duration::hours(47)), "1 days");
        assert_eq!(format_time_delta(Duration::days(10)), "10 days");
    }

    #[test]
    fn status_window_is_inclusive_exclusive() {
        let start = Utc::now();
        let end = start + Duration::minutes(10);
        let status = |now| BallotStatus::at(Some(start), Some(end), now);

        assert_eq!(status(start - Duration::seconds(1)), BallotStatus::Pending);
        assert_eq!(status(start), BallotStatus::Active);
        assert_eq!(status(end - Duration::seconds(1)), BallotStatus::Active);
        assert_eq!(status(end), BallotStatus::Ended);
        assert_eq!(BallotStatus::at(None, None, start), BallotStatus::Active);
    }

    #[test]
    fn status_descriptions() {
        let now = Utc::now();
        assert_eq!(
            describe_status(Some(now + Duration::minutes(5)), None, now),
            "starts in 5 minutes"
        );
        assert_eq!(
            describe_status(None, Some(now + Duration::hours(2)), now),
            "ends in 2 hours"
        );
        assert_eq!(
            describe_status(None, Some(now - Duration::seconds(1)), now),
            "voting closed"
        );
        assert_eq!(describe_status(None, None, now), "voting open");
    }

    #[test]
    fn spec_validation() {
        assert!(BallotSpec::yes_no().validated().is_ok());
        assert!(BallotSpec::with_write_ins().validated().is_ok());

        let mut spec = BallotSpec::yes_no();
        spec.measure = "  ".to_string();
        assert!(matches!(spec.validated(), Err(Error::BadRequest(_))));

        let mut spec = BallotSpec::yes_no();
        spec.options = vec!["Yes".to_string(), " ".to_string()];
        assert!(matches!(spec.validated(), Err(Error::BadRequest(_))));

        let mut spec = BallotSpec::yes_no();
        spec.options.push("x".repeat(MAX_OPTION_LEN + 1));
        assert!(matches!(spec.validated(), Err(Error::BadRequest(_))));

        let mut spec = BallotSpec::yes_no();
        spec.options.push(" Yes ".to_string());
        assert!(matches!(spec.validated(), Err(Error::BadRequest(_))));

        let mut spec = BallotSpec::yes_no();
        spec.start_time = Some(Utc::now());
        spec.end_time = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(spec.validated(), Err(Error::BadRequest(_))));
    }

    #[test]
    fn validation_trims() {
        let mut spec = BallotSpec::yes_no();
        spec.measure = "  Lunch?  ".to_string();
        spec.options = vec![" Pizza".to_string(), "Soup ".to_string(), "".to_string()];
        let spec = spec.validated().unwrap();
        assert_eq!(spec.measure, "Lunch?");
        assert_eq!(spec.options, vec!["Pizza", "Soup"]);
    }

    #[test]
    fn vote_wire_format() {
        let vote: Vote = serde_json::from_str(r#"{"option": 7}"#).unwrap();
        assert_eq!(vote, Vote::Option(7));
        let vote: Vote = serde_json::from_str(r#"{"write_in": "Bob"}"#).unwrap();
        assert_eq!(vote, Vote::WriteIn("Bob".to_string()));
    }

    #[test]
    fn tally_wire_format() {
        let json = serde_json::to_string(&vec![Tally::new("Yes", 3)]).unwrap();
        assert_eq!(json, r#"[{"option":"Yes","count":3}]"#);
    }
}
