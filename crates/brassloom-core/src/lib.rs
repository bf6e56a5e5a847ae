//! Core domain model for BrassLoom: harvested opportunities and the
//! pre-award workbook rows derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "brassloom-core";

pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Formats accepted for dates coming from sources or the hand-off file, tried in order.
pub const ACCEPTED_DATE_FORMATS: [&str; 3] = [ISO_DATE_FORMAT, "%m/%d/%Y", "%Y/%m/%d"];

/// One harvested funding opportunity. This is the record shape written by the
/// harvester and read back verbatim by the sync engine.
///
/// Absent values are empty strings or empty lists, never placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub source: String,
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agency: String,
    #[serde(deserialize_with = "lenient_string")]
    pub assistance_listing: String,
    #[serde(deserialize_with = "lenient_string")]
    pub posted_date: String,
    #[serde(deserialize_with = "lenient_string")]
    pub close_date: String,
    #[serde(deserialize_with = "lenient_string")]
    pub eligibility: String,
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(deserialize_with = "lenient_string_vec")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub description: String,
    pub hbcu_msi_score: u32,
}

impl OpportunityRecord {
    /// Identity used to collapse duplicates: the URL when present, else the id.
    pub fn dedup_key(&self) -> &str {
        if self.url.is_empty() {
            &self.id
        } else {
            &self.url
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientScalar {
    Text(String),
    Int(i64),
    Float(f64),
    Flag(bool),
}

/// Accepts strings, numbers, booleans and null; null becomes an empty string.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<LenientScalar>::deserialize(deserializer)? {
        Some(LenientScalar::Text(s)) => s,
        Some(LenientScalar::Int(n)) => n.to_string(),
        Some(LenientScalar::Float(n)) => n.to_string(),
        Some(LenientScalar::Flag(b)) => b.to_string(),
        None => String::new(),
    })
}

fn lenient_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Column headers of the "Proposals" sheet, in workbook order.
pub const PROPOSAL_COLUMNS: [&str; 32] = [
    "ProposalID",
    "Title",
    "PI_ID",
    "PI_Name",
    "Department",
    "College/Unit",
    "SponsorID",
    "SponsorName",
    "SponsorType",
    "FundingOpportunity",
    "InternalDeadline",
    "DueDate",
    "SubmissionMechanism",
    "ProposalType",
    "Status",
    "PrimeSponsorID",
    "ProjectStart",
    "ProjectEnd",
    "TotalDirect",
    "TotalIndirect",
    "F&A_Rate",
    "CostShareRequired",
    "CostShareAmount",
    "Approvers",
    "HumanSubjects",
    "Animals",
    "Biosafety",
    "COI",
    "ExportControl",
    "DataSecurity",
    "SubawardsCount",
    "Notes",
];

/// Column headers of the "Tasks" sheet, in workbook order.
pub const TASK_COLUMNS: [&str; 7] = [
    "TaskID",
    "ProposalID",
    "Task",
    "DueDate",
    "Owner",
    "Status",
    "Notes",
];

/// A pre-award tracking entry derived from one opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRow {
    pub proposal_id: String,
    pub title: String,
    pub pi_id: String,
    pub pi_name: String,
    pub department: String,
    pub college: String,
    pub sponsor_id: String,
    pub sponsor_name: String,
    pub sponsor_type: String,
    pub funding_opportunity: String,
    pub internal_deadline: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub submission_mechanism: String,
    pub proposal_type: String,
    pub status: String,
    pub prime_sponsor_id: String,
    pub project_start: String,
    pub project_end: String,
    pub total_direct: String,
    pub total_indirect: String,
    pub fa_rate: String,
    pub cost_share_required: String,
    pub cost_share_amount: String,
    pub approvers: String,
    pub human_subjects: String,
    pub animals: String,
    pub biosafety: String,
    pub coi: String,
    pub export_control: String,
    pub data_security: String,
    pub subawards_count: u32,
    pub notes: String,
}

/// A compliance/process task owned by one proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub proposal_id: String,
    pub name: String,
    pub due_date: NaiveDate,
    pub owner: String,
    pub status: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("date is empty")]
    Empty,
    #[error("date `{0}` has fewer than 10 characters")]
    TooShort(String),
    #[error("date `{0}` is not in a recognized format")]
    Unrecognized(String),
}

fn date_head(raw: &str) -> Result<String, DateParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DateParseError::Empty);
    }
    Ok(trimmed.chars().take(10).collect())
}

/// Strict ISO parse of the first 10 characters (`YYYY-MM-DD`), used by the
/// harvest window check and the urgency bonus.
pub fn parse_iso_date(raw: &str) -> Result<NaiveDate, DateParseError> {
    let head = date_head(raw)?;
    if head.chars().count() < 10 {
        return Err(DateParseError::TooShort(raw.trim().to_string()));
    }
    NaiveDate::parse_from_str(&head, ISO_DATE_FORMAT)
        .map_err(|_| DateParseError::Unrecognized(raw.trim().to_string()))
}

/// Parse the first 10 characters against every accepted format.
pub fn parse_flexible_date(raw: &str) -> Result<NaiveDate, DateParseError> {
    let head = date_head(raw)?;
    ACCEPTED_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&head, fmt).ok())
        .ok_or_else(|| DateParseError::Unrecognized(raw.trim().to_string()))
}

/// Rewrite a source date to ISO form. Unparseable text is kept verbatim so
/// the caller-specific fallbacks still see it; missing dates stay empty.
pub fn normalize_source_date(raw: &str) -> String {
    match parse_flexible_date(raw) {
        Ok(date) => date.format(ISO_DATE_FORMAT).to_string(),
        Err(DateParseError::Empty) => String::new(),
        Err(_) => raw.trim().to_string(),
    }
}

pub fn format_optional_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(ISO_DATE_FORMAT).to_string())
        .unwrap_or_default()
}
