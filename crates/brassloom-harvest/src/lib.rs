//! Harvest pipeline: fetch every enabled source in order, score, dedupe,
//! rank, and write the hand-off file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use brassloom_adapters::{adapter_for, Crawlability, HarvestQuery, SourceAdapter};
use brassloom_core::{parse_iso_date, OpportunityRecord};
use brassloom_storage::{write_opportunities, HttpClientConfig, HttpFetcher};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "brassloom-harvest";

pub const DEFAULT_KEYWORDS: [&str; 12] = [
    "HBCU",
    "MSI",
    "minority serving",
    "Hispanic-Serving",
    "HSI",
    "Tribal",
    "TCU",
    "Alaska Native",
    "Native Hawaiian",
    "Black",
    "broadening participation",
    "EPSCoR",
];

pub const KEYWORD_POINTS: u32 = 10;
pub const HBCU_BONUS: u32 = 20;
pub const MSI_BONUS: u32 = 15;

/// Split a comma-separated keyword list, dropping blanks.
pub fn parse_keyword_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub crawlability: Crawlability,
    pub url: String,
}

fn default_enabled() -> bool {
    true
}

/// Ordered source list. Order is fetch order, which decides dedup winners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        let spec = |source_id: &str, display_name: &str, crawlability, url: &str| SourceSpec {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            crawlability,
            url: url.to_string(),
        };
        Self {
            sources: vec![
                spec(
                    "grants-gov",
                    "Grants.gov",
                    Crawlability::Api,
                    "https://www.grants.gov/api/v2/search/search2",
                ),
                spec(
                    "nih-guide",
                    "NIH Guide",
                    Crawlability::Rss,
                    "https://grants.nih.gov/grants/guide/rss/nih-guide.xml",
                ),
                spec(
                    "nsf-funding",
                    "NSF Funding",
                    Crawlability::Rss,
                    "https://www.nsf.gov/rss/rss_www_funding.xml",
                ),
            ],
        }
    }

    /// Read a registry file, falling back to [`SourceRegistry::builtin`] when it does not exist.
    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sources_path: PathBuf,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            user_agent: std::env::var("BRASSLOOM_USER_AGENT")
                .unwrap_or_else(|_| "brassloom-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("BRASSLOOM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            sources_path: std::env::var("BRASSLOOM_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
        }
    }
}

/// Case-insensitive whole-word search, where word characters are
/// alphanumerics and `_`.
pub fn contains_word(text: &str, word: &str) -> bool {
    let text = text.to_lowercase();
    let word = word.to_lowercase();
    if word.is_empty() {
        return false;
    }
    let is_word_char = |c: char| c.is_alphanumeric() || c == '_';
    text.match_indices(&word).any(|(idx, m)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + m.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

/// Urgency bonus for a closing date: +10 within 30 days, +5 within 31..=60,
/// nothing otherwise. Closed, missing and unparseable dates earn nothing.
pub fn urgency_bonus(close_date: &str, today: NaiveDate) -> u32 {
    let Ok(close) = parse_iso_date(close_date) else {
        return 0;
    };
    match (close - today).num_days() {
        0..=30 => 10,
        31..=60 => 5,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct KeywordScorer {
    keywords: Vec<String>,
}

impl KeywordScorer {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn search_text(record: &OpportunityRecord) -> String {
        [
            record.title.as_str(),
            record.description.as_str(),
            record.eligibility.as_str(),
            record.agency.as_str(),
            record.source.as_str(),
        ]
        .join(" ")
        .to_lowercase()
    }

    pub fn score(&self, record: &OpportunityRecord, today: NaiveDate) -> u32 {
        let text = Self::search_text(record);
        let mut score = 0;
        for kw in &self.keywords {
            if text.contains(kw.as_str()) {
                score += KEYWORD_POINTS;
            }
        }
        if contains_word(&text, "HBCU") {
            score += HBCU_BONUS;
        }
        if contains_word(&text, "MSI") {
            score += MSI_BONUS;
        }
        score + urgency_bonus(&record.close_date, today)
    }

    pub fn apply(&self, mut items: Vec<OpportunityRecord>, today: NaiveDate) -> Vec<OpportunityRecord> {
        for item in &mut items {
            item.hbcu_msi_score = self.score(item, today);
        }
        items
    }
}

#[derive(Debug, Default)]
pub struct DedupEngine;

impl DedupEngine {
    /// Keep the first record per dedup key, then order by score descending.
    /// The sort is stable, so equal scores keep fetch order.
    pub fn apply(&self, items: Vec<OpportunityRecord>) -> Vec<OpportunityRecord> {
        let mut seen = HashSet::new();
        let mut kept = items
            .into_iter()
            .filter(|item| seen.insert(item.dedup_key().to_string()))
            .collect::<Vec<_>>();
        kept.sort_by(|a, b| b.hbcu_msi_score.cmp(&a.hbcu_msi_score));
        kept
    }
}

pub fn rank(items: Vec<OpportunityRecord>, keywords: &[String], today: NaiveDate) -> Vec<OpportunityRecord> {
    let scored = KeywordScorer::new(keywords).apply(items, today);
    DedupEngine.apply(scored)
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub sources: usize,
    pub failed_sources: Vec<String>,
    pub fetched_records: usize,
    pub written_records: usize,
    pub out_path: String,
}

pub struct HarvestPipeline {
    http: HttpFetcher,
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl HarvestPipeline {
    pub fn new(config: &HarvestConfig, registry: &SourceRegistry) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let adapters = registry
            .enabled()
            .map(|s| adapter_for(&s.source_id, &s.display_name, s.crawlability, &s.url))
            .collect();
        Ok(Self::with_adapters(http, adapters))
    }

    pub fn with_adapters(http: HttpFetcher, adapters: Vec<Box<dyn SourceAdapter>>) -> Self {
        Self { http, adapters }
    }

    /// Fetch sources one after another. A failing source is logged and
    /// contributes nothing; the returned list names the failures.
    pub async fn collect(&self, query: &HarvestQuery) -> (Vec<OpportunityRecord>, Vec<String>) {
        let mut all = Vec::new();
        let mut failed = Vec::new();
        for adapter in &self.adapters {
            let span = info_span!(
                "source_fetch",
                source_id = adapter.source_id(),
                crawlability = ?adapter.crawlability()
            );
            match adapter.harvest(&self.http, query).instrument(span).await {
                Ok(records) => {
                    info!(source_id = adapter.source_id(), count = records.len(), "source harvested");
                    all.extend(records);
                }
                Err(err) => {
                    warn!(
                        source_id = err.source_id(),
                        error = %err,
                        "{} fetch failed; continuing without it",
                        adapter.display_name()
                    );
                    failed.push(adapter.source_id().to_string());
                }
            }
        }
        (all, failed)
    }

    pub async fn run_once(&self, query: &HarvestQuery, out: &Path) -> Result<HarvestSummary> {
        let (records, failed_sources) = self.collect(query).await;
        let fetched_records = records.len();
        let ranked = rank(records, &query.keywords, query.today);
        write_opportunities(out, &ranked)
            .await
            .with_context(|| format!("writing {}", out.display()))?;

        Ok(HarvestSummary {
            sources: self.adapters.len(),
            failed_sources,
            fetched_records,
            written_records: ranked.len(),
            out_path: out.display().to_string(),
        })
    }
}

pub async fn run_harvest(config: &HarvestConfig, query: &HarvestQuery, out: &Path) -> Result<HarvestSummary> {
    let registry = SourceRegistry::load_or_builtin(&config.sources_path).await?;
    HarvestPipeline::new(config, &registry)?.run_once(query, out).await
}
