//! Source adapter contracts + the Grants.gov search and RSS feed adapters.
//!
//! Each adapter fetches one raw payload and normalizes it into
//! [`OpportunityRecord`]s. Scoring happens later in the harvest pipeline, so
//! every record produced here carries a zero score.

use async_trait::async_trait;
use brassloom_core::{normalize_source_date, parse_iso_date, OpportunityRecord, ISO_DATE_FORMAT};
use brassloom_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDate, Utc};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "brassloom-adapters";

pub const DESCRIPTION_MAX_CHARS: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    Api,
    Rss,
}

/// Parameters shared by every source for one harvest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestQuery {
    /// Posted-within window, in days, applied by the search API adapter.
    pub days: i64,
    pub keywords: Vec<String>,
    pub today: NaiveDate,
}

impl HarvestQuery {
    pub fn new(days: i64, keywords: Vec<String>, today: NaiveDate) -> Self {
        Self {
            days,
            keywords,
            today,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_id}: could not parse payload: {message}")]
    Parse { source_id: String, message: String },
}

impl AdapterError {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Fetch(err) => err.source_id(),
            Self::Parse { source_id, .. } => source_id,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn crawlability(&self) -> Crawlability;

    async fn fetch(&self, http: &HttpFetcher, query: &HarvestQuery) -> Result<Vec<u8>, AdapterError>;

    fn parse(&self, body: &[u8], query: &HarvestQuery) -> Result<Vec<OpportunityRecord>, AdapterError>;

    async fn harvest(
        &self,
        http: &HttpFetcher,
        query: &HarvestQuery,
    ) -> Result<Vec<OpportunityRecord>, AdapterError> {
        let body = self.fetch(http, query).await?;
        self.parse(&body, query)
    }
}

pub fn adapter_for(
    source_id: &str,
    display_name: &str,
    crawlability: Crawlability,
    url: &str,
) -> Box<dyn SourceAdapter> {
    match crawlability {
        Crawlability::Api => Box::new(GrantsGovSearchAdapter {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            url: url.to_string(),
        }),
        Crawlability::Rss => Box::new(RssFeedAdapter {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            url: url.to_string(),
        }),
    }
}

/// True unless the date parses as ISO and lies more than `days` before `today`.
/// Empty, short or otherwise unparseable dates count as in range.
pub fn posted_within(date: &str, days: i64, today: NaiveDate) -> bool {
    match parse_iso_date(date) {
        Ok(posted) => (today - posted).num_days() <= days,
        Err(_) => true,
    }
}

pub fn mentions_any_keyword(text: &str, keywords: &[String]) -> bool {
    let text = text.to_lowercase();
    keywords
        .iter()
        .any(|kw| !kw.is_empty() && text.contains(&kw.to_lowercase()))
}

/// Reduce markup to its text content; plain text passes through trimmed.
pub fn plain_text(raw: &str) -> String {
    if !raw.contains('<') {
        return raw.trim().to_string();
    }
    let fragment = Html::parse_fragment(raw);
    fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// String or number at `path`, rendered as trimmed non-empty text.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let text = match json_path(value, path)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_path(value, path)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn first_text(value: &JsonValue, paths: &[&[&str]]) -> String {
    paths
        .iter()
        .find_map(|path| json_text(value, path))
        .unwrap_or_default()
}

/// Grants.gov `search2` REST endpoint.
#[derive(Debug, Clone)]
pub struct GrantsGovSearchAdapter {
    source_id: String,
    display_name: String,
    url: String,
}

impl GrantsGovSearchAdapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            source_id: "grants-gov".to_string(),
            display_name: "Grants.gov".to_string(),
            url: url.into(),
        }
    }

    pub fn search_params(query: &HarvestQuery) -> Vec<(&'static str, String)> {
        let keyword = query
            .keywords
            .iter()
            .map(|k| format!("\"{k}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        vec![
            ("startRecordNum", "0".to_string()),
            ("oppStatuses", "forecasted|posted".to_string()),
            ("sortBy", "openDate|desc".to_string()),
            ("keyword", keyword),
        ]
    }

    fn normalize_hit(&self, hit: &JsonValue) -> OpportunityRecord {
        let assistance_listing = json_path(hit, &["cfdaList"])
            .and_then(|v| v.as_array())
            .and_then(|list| list.first())
            .and_then(|first| match first {
                JsonValue::String(s) => Some(s.trim().to_string()),
                other => json_text(other, &["cfdaNumber"]),
            })
            .unwrap_or_default();

        let eligibility = json_path(hit, &["eligibility"])
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .map(|e| json_text(e, &["eligibilityName"]).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        let synopsis = first_text(hit, &[&["synopsis"], &["description"]]);

        OpportunityRecord {
            id: first_text(
                hit,
                &[&["opportunityNumber"], &["number"], &["opportunityId"], &["id"]],
            ),
            source: self.display_name.clone(),
            title: first_text(hit, &[&["title"]]),
            agency: first_text(hit, &[&["agency"], &["agencyName"], &["agencyCode"]]),
            assistance_listing,
            posted_date: normalize_source_date(&first_text(hit, &[&["openDate"]])),
            close_date: normalize_source_date(&first_text(hit, &[&["closeDate"]])),
            eligibility,
            url: first_text(hit, &[&["url"]]),
            tags: json_string_vec(hit, &["category"]),
            description: truncate_chars(&plain_text(&synopsis), DESCRIPTION_MAX_CHARS),
            hbcu_msi_score: 0,
        }
    }
}

#[async_trait]
impl SourceAdapter for GrantsGovSearchAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch(&self, http: &HttpFetcher, query: &HarvestQuery) -> Result<Vec<u8>, AdapterError> {
        let params = Self::search_params(query);
        let resp = http.fetch_bytes(&self.source_id, &self.url, &params).await?;
        debug!(
            source_id = %self.source_id,
            status = resp.status.as_u16(),
            final_url = %resp.final_url,
            bytes = resp.body.len(),
            "payload fetched"
        );
        Ok(resp.body)
    }

    fn parse(&self, body: &[u8], query: &HarvestQuery) -> Result<Vec<OpportunityRecord>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(body).map_err(|e| AdapterError::Parse {
            source_id: self.source_id.clone(),
            message: format!("invalid JSON: {e}"),
        })?;

        let Some(hits) = json_path(&value, &["opportunities"])
            .and_then(|v| v.as_array())
            .or_else(|| json_path(&value, &["data", "oppHits"]).and_then(|v| v.as_array()))
        else {
            debug!(source_id = %self.source_id, "response carried no opportunities array");
            return Ok(Vec::new());
        };

        Ok(hits
            .iter()
            .map(|hit| self.normalize_hit(hit))
            .filter(|record| posted_within(&record.posted_date, query.days, query.today))
            .collect())
    }
}

/// Generic RSS 2.0 feed. Feeds carry no closing date, assistance listing or
/// eligibility, so those fields stay empty.
#[derive(Debug, Clone)]
pub struct RssFeedAdapter {
    source_id: String,
    display_name: String,
    url: String,
}

impl RssFeedAdapter {
    pub fn new(
        source_id: impl Into<String>,
        display_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            url: url.into(),
        }
    }

    fn normalize_item(&self, item: &rss::Item) -> OpportunityRecord {
        let link = item.link().unwrap_or_default().trim().to_string();
        let id = item
            .guid()
            .map(|g| g.value().trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| link.clone());
        let posted_date = item
            .pub_date()
            .and_then(|raw| DateTime::parse_from_rfc2822(raw.trim()).ok())
            .map(|dt| {
                dt.with_timezone(&Utc)
                    .date_naive()
                    .format(ISO_DATE_FORMAT)
                    .to_string()
            })
            .unwrap_or_default();
        let description = truncate_chars(
            &plain_text(item.description().unwrap_or_default()),
            DESCRIPTION_MAX_CHARS,
        );

        OpportunityRecord {
            id,
            source: self.display_name.clone(),
            title: item.title().unwrap_or_default().trim().to_string(),
            agency: self.display_name.clone(),
            assistance_listing: String::new(),
            posted_date,
            close_date: String::new(),
            eligibility: String::new(),
            url: link,
            tags: Vec::new(),
            description,
            hbcu_msi_score: 0,
        }
    }
}

#[async_trait]
impl SourceAdapter for RssFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Rss
    }

    async fn fetch(&self, http: &HttpFetcher, _query: &HarvestQuery) -> Result<Vec<u8>, AdapterError> {
        let resp = http.fetch_bytes(&self.source_id, &self.url, &[]).await?;
        debug!(
            source_id = %self.source_id,
            status = resp.status.as_u16(),
            final_url = %resp.final_url,
            bytes = resp.body.len(),
            "payload fetched"
        );
        Ok(resp.body)
    }

    fn parse(&self, body: &[u8], query: &HarvestQuery) -> Result<Vec<OpportunityRecord>, AdapterError> {
        let channel = rss::Channel::read_from(body).map_err(|e| AdapterError::Parse {
            source_id: self.source_id.clone(),
            message: e.to_string(),
        })?;

        Ok(channel
            .items()
            .iter()
            .map(|item| self.normalize_item(item))
            .filter(|record| {
                mentions_any_keyword(
                    &format!("{} {}", record.title, record.description),
                    &query.keywords,
                )
            })
            .collect())
    }
}
