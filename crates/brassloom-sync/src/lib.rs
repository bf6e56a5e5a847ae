//! Workbook sync: turn ranked opportunities into Proposals + Tasks rows.
//!
//! The workbook is opened once, appended to in memory, and saved once at the
//! end of the run. Existing rows are never rewritten.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use brassloom_core::{
    format_optional_date, parse_flexible_date, OpportunityRecord, ProposalRow, TaskRow,
    ISO_DATE_FORMAT, PROPOSAL_COLUMNS, TASK_COLUMNS,
};
use brassloom_storage::{read_opportunities, InputError};
use chrono::{Days, NaiveDate};
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use umya_spreadsheet::{Spreadsheet, Worksheet};

pub const CRATE_NAME: &str = "brassloom-sync";

pub const PROPOSALS_SHEET: &str = "Proposals";
pub const TASKS_SHEET: &str = "Tasks";
pub const PROPOSAL_ID_PREFIX: &str = "GSU-P-";
pub const TASK_ID_PREFIX: &str = "TSK-";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("workbook not found: {0}")]
    MissingWorkbook(PathBuf),
    #[error(transparent)]
    MissingInput(#[from] InputError),
    #[error("workbook {path} has no `{sheet}` sheet")]
    MissingSheet { path: PathBuf, sheet: &'static str },
    #[error("config {path}: {message}")]
    Config { path: PathBuf, message: String },
    #[error("workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrincipalInvestigator {
    pub id: String,
    pub name: String,
    pub dept: String,
    pub college: String,
}

/// Substring tables for sponsor classification, matched case-insensitively
/// against the sponsor name. Federal is checked before state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SponsorRules {
    #[serde(default = "default_federal_markers")]
    pub federal: Vec<String>,
    #[serde(default = "default_state_markers")]
    pub state: Vec<String>,
}

impl Default for SponsorRules {
    fn default() -> Self {
        Self {
            federal: default_federal_markers(),
            state: default_state_markers(),
        }
    }
}

fn default_federal_markers() -> Vec<String> {
    [
        "national science foundation",
        "nih",
        "health",
        "grants.gov",
        "nasa",
        "nsf",
        "department of",
        "dod",
        "doe",
        "usda",
        "epa",
        "nsf funding",
        "nih guide",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_state_markers() -> Vec<String> {
    vec!["board of regents".to_string(), "state".to_string()]
}

impl SponsorRules {
    /// Best-effort sponsor type. Empty sponsor names stay unclassified.
    pub fn classify(&self, sponsor: &str) -> String {
        let sponsor = sponsor.trim().to_lowercase();
        if sponsor.is_empty() {
            return String::new();
        }
        let hit = |markers: &[String]| {
            markers
                .iter()
                .any(|m| !m.is_empty() && sponsor.contains(&m.to_lowercase()))
        };
        if hit(&self.federal) {
            "Federal".to_string()
        } else if hit(&self.state) {
            "State".to_string()
        } else {
            "Nonprofit".to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    pub default_pi: PrincipalInvestigator,
    #[serde(default = "default_offset_days")]
    pub internal_deadline_offset_days: u64,
    #[serde(default = "default_proposal_type")]
    pub default_proposal_type: String,
    #[serde(default = "default_status")]
    pub default_status: String,
    /// Source/agency substring -> submission mechanism, checked in file order.
    #[serde(default)]
    pub mechanism_map: IndexMap<String, String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sponsor_rules: SponsorRules,
    #[serde(default = "default_fallback_anchor_days")]
    pub fallback_anchor_days: u64,
    #[serde(default = "default_importer_name")]
    pub importer_name: String,
}

fn default_offset_days() -> u64 {
    7
}

fn default_proposal_type() -> String {
    "New".to_string()
}

fn default_status() -> String {
    "Department Review".to_string()
}

fn default_fallback_anchor_days() -> u64 {
    30
}

fn default_importer_name() -> String {
    "BrassLoom".to_string()
}

impl SyncConfig {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, SyncError> {
        serde_yaml::from_str(text).map_err(|e| SyncError::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// Mechanism label for a record: the first map key found in the source
    /// (or agency when the source is blank), then the Grants.gov URL rule.
    pub fn submission_mechanism(&self, record: &OpportunityRecord) -> String {
        let origin = if record.source.trim().is_empty() {
            record.agency.trim()
        } else {
            record.source.trim()
        }
        .to_lowercase();
        if let Some(label) = self
            .mechanism_map
            .iter()
            .find(|(key, _)| !key.is_empty() && origin.contains(&key.to_lowercase()))
            .map(|(_, label)| label.clone())
        {
            return label;
        }
        if record.url.to_lowercase().contains("grants.gov") {
            "Grants.gov".to_string()
        } else {
            "Other".to_string()
        }
    }
}

/// Which records are candidates for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// Lower-cased needles matched against the whole serialized record.
    Keywords(Vec<String>),
}

impl Selection {
    /// `all` wins over any filter. An empty filter falls back to the configured
    /// keywords; with none configured either, nothing is selected.
    pub fn from_flags(all: bool, filter: Option<&str>, config: &SyncConfig) -> Self {
        if all {
            return Self::All;
        }
        let mut needles = filter
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if needles.is_empty() {
            needles = config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if needles.is_empty() {
            warn!("no --filter given and the config has no keywords; nothing will be selected");
        }
        Self::Keywords(needles)
    }

    pub fn matches(&self, record: &OpportunityRecord) -> bool {
        match self {
            Self::All => true,
            Self::Keywords(needles) => {
                let blob = serde_json::to_string(record)
                    .unwrap_or_default()
                    .to_lowercase();
                needles.iter().any(|n| blob.contains(n.as_str()))
            }
        }
    }
}

/// Hands out `PREFIX` + zero-padded sequence numbers, one past the highest
/// number seen so far. Numbers are kept as decimal digit strings so any
/// suffix length found in a workbook is honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSequence {
    prefix: String,
    /// Digits without leading zeros; empty means zero.
    max_seen: String,
}

impl IdSequence {
    pub fn from_existing<'a>(prefix: &str, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let max_seen = ids
            .into_iter()
            .filter_map(|id| id_number(prefix, id))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .unwrap_or_default();
        Self {
            prefix: prefix.to_string(),
            max_seen,
        }
    }

    pub fn next_id(&mut self) -> String {
        self.max_seen = increment_decimal(&self.max_seen);
        format!("{}{:0>4}", self.prefix, self.max_seen)
    }
}

/// Leading digits right after `prefix`, without leading zeros.
fn id_number(prefix: &str, id: &str) -> Option<String> {
    let rest = id.strip_prefix(prefix)?;
    let digits = rest
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    Some(digits.trim_start_matches('0').to_string())
}

fn increment_decimal(digits: &str) -> String {
    let mut out = digits.chars().collect::<Vec<_>>();
    for d in out.iter_mut().rev() {
        if *d == '9' {
            *d = '0';
        } else {
            *d = char::from(*d as u8 + 1);
            return out.into_iter().collect();
        }
    }
    out.insert(0, '1');
    out.into_iter().collect()
}

struct TaskTemplate {
    name: &'static str,
    days_before_due: u64,
    owner: &'static str,
    notes: &'static str,
}

const MECHANISM_PLACEHOLDER: &str = "{mechanism}";

const TASK_TEMPLATES: [TaskTemplate; 7] = [
    TaskTemplate {
        name: "Complete GSU Internal Routing Form",
        days_before_due: 10,
        owner: "PI",
        notes: "Attach signed PDF",
    },
    TaskTemplate {
        name: "COI Disclosures for all key personnel",
        days_before_due: 9,
        owner: "PI/OSP",
        notes: "",
    },
    TaskTemplate {
        name: "Subrecipient Commitment Form(s)",
        days_before_due: 8,
        owner: "OSP",
        notes: "Collect UEI and F&A rate docs",
    },
    TaskTemplate {
        name: "Export Control & Data Security review",
        days_before_due: 8,
        owner: "Compliance",
        notes: "If foreign collaborators or controlled data",
    },
    TaskTemplate {
        name: "Final Budget & Justification",
        days_before_due: 7,
        owner: "OSP Pre-Award",
        notes: "Check salary cap and F&A base",
    },
    TaskTemplate {
        name: "Create application in {mechanism}",
        days_before_due: 7,
        owner: "OSP Pre-Award",
        notes: "Confirm FOA & forms",
    },
    TaskTemplate {
        name: "Dean/Provost cost-share letter (if required)",
        days_before_due: 7,
        owner: "Dean/Provost",
        notes: "Upload letter",
    },
];

pub const TASK_STATUS_PENDING: &str = "Pending";

/// Due date: close date, else posted date, else none. Unparseable dates count as absent.
pub fn derive_due_date(record: &OpportunityRecord) -> Option<NaiveDate> {
    parse_flexible_date(&record.close_date)
        .or_else(|_| parse_flexible_date(&record.posted_date))
        .ok()
}

pub fn build_proposal(
    record: &OpportunityRecord,
    config: &SyncConfig,
    proposal_id: String,
    today: NaiveDate,
) -> ProposalRow {
    let sponsor_name = if record.agency.trim().is_empty() {
        record.source.trim()
    } else {
        record.agency.trim()
    }
    .to_string();
    let funding_opportunity = if record.id.is_empty() {
        record.assistance_listing.clone()
    } else {
        record.id.clone()
    };
    let due_date = derive_due_date(record);
    let internal_deadline =
        due_date.and_then(|d| d.checked_sub_days(Days::new(config.internal_deadline_offset_days)));

    ProposalRow {
        proposal_id,
        title: record.title.trim().to_string(),
        pi_id: config.default_pi.id.clone(),
        pi_name: config.default_pi.name.clone(),
        department: config.default_pi.dept.clone(),
        college: config.default_pi.college.clone(),
        sponsor_id: String::new(),
        sponsor_type: config.sponsor_rules.classify(&sponsor_name),
        sponsor_name,
        funding_opportunity,
        internal_deadline,
        due_date,
        submission_mechanism: config.submission_mechanism(record),
        proposal_type: config.default_proposal_type.clone(),
        status: config.default_status.clone(),
        prime_sponsor_id: String::new(),
        project_start: String::new(),
        project_end: String::new(),
        total_direct: String::new(),
        total_indirect: String::new(),
        fa_rate: String::new(),
        cost_share_required: "No".to_string(),
        cost_share_amount: String::new(),
        approvers: String::new(),
        human_subjects: "No".to_string(),
        animals: "No".to_string(),
        biosafety: "No".to_string(),
        coi: "Yes".to_string(),
        export_control: "No".to_string(),
        data_security: "No".to_string(),
        subawards_count: 0,
        notes: format!(
            "Imported by {} on {}",
            config.importer_name,
            today.format(ISO_DATE_FORMAT)
        ),
    }
}

/// The seven standard tasks, anchored to the proposal due date or, without
/// one, to `today + fallback_anchor_days`.
pub fn build_tasks(
    proposal: &ProposalRow,
    config: &SyncConfig,
    task_ids: &mut IdSequence,
    today: NaiveDate,
) -> Vec<TaskRow> {
    let anchor = proposal
        .due_date
        .or_else(|| today.checked_add_days(Days::new(config.fallback_anchor_days)))
        .unwrap_or(today);

    TASK_TEMPLATES
        .iter()
        .map(|t| TaskRow {
            task_id: task_ids.next_id(),
            proposal_id: proposal.proposal_id.clone(),
            name: t
                .name
                .replace(MECHANISM_PLACEHOLDER, &proposal.submission_mechanism),
            due_date: anchor
                .checked_sub_days(Days::new(t.days_before_due))
                .unwrap_or(anchor),
            owner: t.owner.to_string(),
            status: TASK_STATUS_PENDING.to_string(),
            notes: t.notes.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
}

pub fn proposal_cells(row: &ProposalRow) -> Vec<CellValue> {
    let text = |s: &str| CellValue::Text(s.to_string());
    vec![
        text(&row.proposal_id),
        text(&row.title),
        text(&row.pi_id),
        text(&row.pi_name),
        text(&row.department),
        text(&row.college),
        text(&row.sponsor_id),
        text(&row.sponsor_name),
        text(&row.sponsor_type),
        text(&row.funding_opportunity),
        CellValue::Text(format_optional_date(row.internal_deadline)),
        CellValue::Text(format_optional_date(row.due_date)),
        text(&row.submission_mechanism),
        text(&row.proposal_type),
        text(&row.status),
        text(&row.prime_sponsor_id),
        text(&row.project_start),
        text(&row.project_end),
        text(&row.total_direct),
        text(&row.total_indirect),
        text(&row.fa_rate),
        text(&row.cost_share_required),
        text(&row.cost_share_amount),
        text(&row.approvers),
        text(&row.human_subjects),
        text(&row.animals),
        text(&row.biosafety),
        text(&row.coi),
        text(&row.export_control),
        text(&row.data_security),
        CellValue::Number(f64::from(row.subawards_count)),
        text(&row.notes),
    ]
}

pub fn task_cells(row: &TaskRow) -> Vec<CellValue> {
    vec![
        CellValue::Text(row.task_id.clone()),
        CellValue::Text(row.proposal_id.clone()),
        CellValue::Text(row.name.clone()),
        CellValue::Text(row.due_date.format(ISO_DATE_FORMAT).to_string()),
        CellValue::Text(row.owner.clone()),
        CellValue::Text(row.status.clone()),
        CellValue::Text(row.notes.clone()),
    ]
}

/// A proposal already in the workbook, as far as duplicate and ID checks care.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingProposal {
    pub proposal_id: String,
    pub title: String,
}

/// The two-table tracking store the sync engine appends to.
pub trait TrackerWorkbook {
    fn existing_proposals(&self) -> Vec<ExistingProposal>;
    fn existing_task_ids(&self) -> Vec<String>;
    fn append_proposal(&mut self, row: &ProposalRow);
    fn append_task(&mut self, row: &TaskRow);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub imported: usize,
    pub skipped_existing: usize,
    pub candidates: usize,
    pub proposal_ids: Vec<String>,
    pub tasks_created: usize,
}

pub struct SyncEngine<'a> {
    config: &'a SyncConfig,
    today: NaiveDate,
}

impl<'a> SyncEngine<'a> {
    pub fn new(config: &'a SyncConfig, today: NaiveDate) -> Self {
        Self { config, today }
    }

    /// Append one proposal + seven tasks per selected record whose trimmed,
    /// lower-cased title is not already present. ID counters are derived from
    /// the workbook once, up front.
    pub fn sync<W: TrackerWorkbook>(
        &self,
        records: &[OpportunityRecord],
        selection: &Selection,
        book: &mut W,
    ) -> SyncOutcome {
        let existing = book.existing_proposals();
        let mut titles = existing
            .iter()
            .map(|p| p.title.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<HashSet<_>>();
        let mut proposal_ids = IdSequence::from_existing(
            PROPOSAL_ID_PREFIX,
            existing.iter().map(|p| p.proposal_id.as_str()),
        );
        let task_id_list = book.existing_task_ids();
        let mut task_ids =
            IdSequence::from_existing(TASK_ID_PREFIX, task_id_list.iter().map(String::as_str));

        let mut outcome = SyncOutcome::default();
        for record in records.iter().filter(|r| selection.matches(r)) {
            outcome.candidates += 1;
            let key = record.title.trim().to_lowercase();
            if key.is_empty() || titles.contains(&key) {
                outcome.skipped_existing += 1;
                continue;
            }

            let proposal = build_proposal(record, self.config, proposal_ids.next_id(), self.today);
            let tasks = build_tasks(&proposal, self.config, &mut task_ids, self.today);
            book.append_proposal(&proposal);
            for task in &tasks {
                book.append_task(task);
            }
            debug!(proposal_id = %proposal.proposal_id, title = %proposal.title, "queued proposal");

            titles.insert(key);
            outcome.imported += 1;
            outcome.tasks_created += tasks.len();
            outcome.proposal_ids.push(proposal.proposal_id);
        }
        outcome
    }
}

/// `.xlsx` workbook with "Proposals" and "Tasks" sheets whose header rows
/// are already laid out.
pub struct XlsxWorkbook {
    path: PathBuf,
    book: Spreadsheet,
}

impl XlsxWorkbook {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(SyncError::MissingWorkbook(path));
        }
        let book = umya_spreadsheet::reader::xlsx::read(&path).map_err(|e| SyncError::Workbook {
            path: path.clone(),
            message: e.to_string(),
        })?;
        for sheet in [PROPOSALS_SHEET, TASKS_SHEET] {
            if book.get_sheet_by_name(sheet).is_none() {
                return Err(SyncError::MissingSheet { path, sheet });
            }
        }
        Ok(Self { path, book })
    }

    pub fn save(&self) -> Result<(), SyncError> {
        umya_spreadsheet::writer::xlsx::write(&self.book, &self.path).map_err(|e| SyncError::Workbook {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn sheet(&self, name: &str) -> Option<&Worksheet> {
        self.book.get_sheet_by_name(name)
    }

    /// Data rows (below the header) with at least one non-empty cell.
    fn data_rows(&self, name: &str) -> Vec<Vec<String>> {
        let Some(sheet) = self.sheet(name) else {
            return Vec::new();
        };
        let width = sheet.get_highest_column();
        (2..=sheet.get_highest_row())
            .map(|row| {
                (1..=width)
                    .map(|col| sheet.get_value((col, row)))
                    .collect::<Vec<_>>()
            })
            .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
            .collect()
    }

    fn append_row(&mut self, name: &str, cells: &[CellValue]) {
        let Some(sheet) = self.book.get_sheet_by_name_mut(name) else {
            return;
        };
        let row = sheet.get_highest_row() + 1;
        for (idx, value) in cells.iter().enumerate() {
            let cell = sheet.get_cell_mut((idx as u32 + 1, row));
            match value {
                CellValue::Text(text) => {
                    cell.set_value_string(text.clone());
                }
                CellValue::Number(n) => {
                    cell.set_value_number(*n);
                }
            }
        }
    }
}

impl TrackerWorkbook for XlsxWorkbook {
    fn existing_proposals(&self) -> Vec<ExistingProposal> {
        self.data_rows(PROPOSALS_SHEET)
            .into_iter()
            .map(|mut cells| {
                cells.resize(2, String::new());
                ExistingProposal {
                    proposal_id: std::mem::take(&mut cells[0]),
                    title: std::mem::take(&mut cells[1]),
                }
            })
            .collect()
    }

    fn existing_task_ids(&self) -> Vec<String> {
        self.data_rows(TASKS_SHEET)
            .into_iter()
            .filter_map(|cells| cells.into_iter().next())
            .filter(|id| !id.trim().is_empty())
            .collect()
    }

    fn append_proposal(&mut self, row: &ProposalRow) {
        self.append_row(PROPOSALS_SHEET, &proposal_cells(row));
    }

    fn append_task(&mut self, row: &TaskRow) {
        self.append_row(TASKS_SHEET, &task_cells(row));
    }
}

/// Create an empty tracking workbook with both header rows.
pub fn create_tracking_workbook(path: impl AsRef<Path>) -> Result<(), SyncError> {
    let path = path.as_ref();
    let workbook_error = |message: String| SyncError::Workbook {
        path: path.to_path_buf(),
        message,
    };
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    for (name, headers) in [
        (PROPOSALS_SHEET, &PROPOSAL_COLUMNS[..]),
        (TASKS_SHEET, &TASK_COLUMNS[..]),
    ] {
        let sheet = book
            .new_sheet(name)
            .map_err(|e| workbook_error(e.to_string()))?;
        for (idx, header) in headers.iter().enumerate() {
            sheet
                .get_cell_mut((idx as u32 + 1, 1))
                .set_value_string(*header);
        }
    }
    umya_spreadsheet::writer::xlsx::write(&book, path).map_err(|e| workbook_error(e.to_string()))
}

/// Full sync run: read the hand-off file, open the workbook, append, save once.
pub async fn run_sync(
    ops_path: &Path,
    workbook_path: &Path,
    selection: &Selection,
    config: &SyncConfig,
    today: NaiveDate,
) -> Result<SyncOutcome, SyncError> {
    let records = read_opportunities(ops_path).await?;
    let mut book = XlsxWorkbook::open(workbook_path)?;

    let outcome = SyncEngine::new(config, today).sync(&records, selection, &mut book);
    book.save()?;

    info!(
        imported = outcome.imported,
        skipped = outcome.skipped_existing,
        candidates = outcome.candidates,
        tasks = outcome.tasks_created,
        workbook = %workbook_path.display(),
        "sync finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_YAML: &str = r#"
default_pi:
  id: "900123456"
  name: "Dr. Jordan Ellis"
  dept: "Biology"
  college: "College of Arts and Sciences"
internal_deadline_offset_days: 7
mechanism_map:
  NIH: "NIH ASSIST"
  NSF: "Research.gov"
keywords: ["HBCU", "MSI"]
"#;

    fn config() -> SyncConfig {
        SyncConfig::from_yaml_str(CONFIG_YAML, Path::new("test.yaml")).unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn opp(title: &str, url: &str) -> OpportunityRecord {
        OpportunityRecord {
            id: format!("ID-{title}"),
            source: "Grants.gov".into(),
            agency: "Department of Education".into(),
            title: title.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct MemoryWorkbook {
        proposals: Vec<ProposalRow>,
        seeded: Vec<ExistingProposal>,
        tasks: Vec<TaskRow>,
        seeded_task_ids: Vec<String>,
    }

    impl TrackerWorkbook for MemoryWorkbook {
        fn existing_proposals(&self) -> Vec<ExistingProposal> {
            self.seeded.clone()
        }
        fn existing_task_ids(&self) -> Vec<String> {
            self.seeded_task_ids.clone()
        }
        fn append_proposal(&mut self, row: &ProposalRow) {
            self.proposals.push(row.clone());
        }
        fn append_task(&mut self, row: &TaskRow) {
            self.tasks.push(row.clone());
        }
    }

    #[test]
    fn id_sequence_starts_at_one_and_skips_past_max() {
        let mut empty = IdSequence::from_existing(PROPOSAL_ID_PREFIX, Vec::<&str>::new());
        assert_eq!(empty.next_id(), "GSU-P-0001");

        let mut seq = IdSequence::from_existing(PROPOSAL_ID_PREFIX, ["GSU-P-0001", "GSU-P-0003"]);
        assert_eq!(seq.next_id(), "GSU-P-0004");
        assert_eq!(seq.next_id(), "GSU-P-0005");
    }

    #[test]
    fn id_sequence_ignores_foreign_ids_and_uses_max_not_last() {
        let mut seq = IdSequence::from_existing(
            TASK_ID_PREFIX,
            ["TSK-0009", "TSK-0002", "junk", "TSK-", "XTSK-0050", "TSK-0004-old"],
        );
        assert_eq!(seq.next_id(), "TSK-0010");
    }

    #[test]
    fn id_sequence_handles_suffixes_beyond_machine_integers() {
        let mut at_u32_max = IdSequence::from_existing(PROPOSAL_ID_PREFIX, ["GSU-P-4294967295"]);
        assert_eq!(at_u32_max.next_id(), "GSU-P-4294967296");

        let mut wide = IdSequence::from_existing(PROPOSAL_ID_PREFIX, ["GSU-P-99999999999", "GSU-P-0002"]);
        assert_eq!(wide.next_id(), "GSU-P-100000000000");
        assert_eq!(wide.next_id(), "GSU-P-100000000001");

        let mut past_u64 =
            IdSequence::from_existing(TASK_ID_PREFIX, ["TSK-18446744073709551615", "TSK-0000000000000000000042"]);
        assert_eq!(past_u64.next_id(), "TSK-18446744073709551616");
    }

    #[test]
    fn id_sequence_rolls_past_four_digits_and_ignores_zero_padding() {
        let mut seq = IdSequence::from_existing(TASK_ID_PREFIX, ["TSK-9999", "TSK-00012"]);
        assert_eq!(seq.next_id(), "TSK-10000");

        let mut zero = IdSequence::from_existing(TASK_ID_PREFIX, ["TSK-0000"]);
        assert_eq!(zero.next_id(), "TSK-0001");
    }

    #[test]
    fn sponsor_types_follow_rule_tables() {
        let rules = SponsorRules::default();
        assert_eq!(rules.classify("National Science Foundation"), "Federal");
        assert_eq!(rules.classify("NIH Guide"), "Federal");
        assert_eq!(rules.classify("Georgia Board of Regents"), "State");
        assert_eq!(rules.classify("Kresge Foundation"), "Nonprofit");
        assert_eq!(rules.classify("  "), "");
    }

    #[test]
    fn mechanism_uses_map_then_url_fallback() {
        let cfg = config();
        let mut record = opp("x", "https://www.grants.gov/search-results-detail/1");
        record.source = "NIH Guide".into();
        assert_eq!(cfg.submission_mechanism(&record), "NIH ASSIST");

        record.source = "Grants.gov".into();
        assert_eq!(cfg.submission_mechanism(&record), "Grants.gov");

        record.url = "https://foundation.example.org/apply".into();
        assert_eq!(cfg.submission_mechanism(&record), "Other");
    }

    #[test]
    fn tasks_follow_fixed_offsets_from_due_date() {
        let cfg = config();
        let mut record = opp("Deadline check", "");
        record.close_date = "2025-06-30".into();
        let proposal = build_proposal(&record, &cfg, "GSU-P-0001".into(), ymd(2025, 6, 1));
        let mut ids = IdSequence::from_existing(TASK_ID_PREFIX, Vec::<&str>::new());
        let tasks = build_tasks(&proposal, &cfg, &mut ids, ymd(2025, 6, 1));

        let dues = tasks
            .iter()
            .map(|t| t.due_date.format(ISO_DATE_FORMAT).to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            dues,
            vec![
                "2025-06-20", "2025-06-21", "2025-06-22", "2025-06-22", "2025-06-23",
                "2025-06-23", "2025-06-23"
            ]
        );
        assert_eq!(tasks[0].task_id, "TSK-0001");
        assert_eq!(tasks[6].task_id, "TSK-0007");
        assert!(tasks.iter().all(|t| t.status == "Pending" && t.proposal_id == "GSU-P-0001"));
        assert_eq!(tasks[5].name, "Create application in Other");
        assert_eq!(proposal.internal_deadline, Some(ymd(2025, 6, 23)));
    }

    #[test]
    fn due_date_falls_back_to_posted_then_to_anchor() {
        let cfg = config();
        let today = ymd(2025, 6, 1);
        let mut record = opp("Posted only", "");
        record.posted_date = "05/01/2025".into();
        let proposal = build_proposal(&record, &cfg, "GSU-P-0001".into(), today);
        assert_eq!(proposal.due_date, Some(ymd(2025, 5, 1)));

        record.posted_date = "rolling".into();
        let undated = build_proposal(&record, &cfg, "GSU-P-0002".into(), today);
        assert_eq!(undated.due_date, None);
        assert_eq!(undated.internal_deadline, None);

        let mut ids = IdSequence::from_existing(TASK_ID_PREFIX, Vec::<&str>::new());
        let tasks = build_tasks(&undated, &cfg, &mut ids, today);
        // Anchor is today + 30 = 2025-07-01.
        assert_eq!(tasks[0].due_date, ymd(2025, 6, 21));
        assert_eq!(tasks[6].due_date, ymd(2025, 6, 24));
    }

    #[test]
    fn proposal_defaults_and_sponsor_fields() {
        let cfg = config();
        let mut record = opp("  Capacity Grant ", "");
        record.id.clear();
        record.assistance_listing = "84.031B".into();
        let p = build_proposal(&record, &cfg, "GSU-P-0007".into(), ymd(2025, 6, 1));
        assert_eq!(p.title, "Capacity Grant");
        assert_eq!(p.pi_name, "Dr. Jordan Ellis");
        assert_eq!(p.sponsor_name, "Department of Education");
        assert_eq!(p.sponsor_type, "Federal");
        assert_eq!(p.funding_opportunity, "84.031B");
        assert_eq!(p.proposal_type, "New");
        assert_eq!(p.status, "Department Review");
        assert_eq!(p.coi, "Yes");
        assert_eq!(p.notes, "Imported by BrassLoom on 2025-06-01");
        assert_eq!(proposal_cells(&p).len(), PROPOSAL_COLUMNS.len());
    }

    #[test]
    fn same_title_imports_once_per_run() {
        let cfg = config();
        let records = vec![
            opp("HBCU Research Grant", "https://a/1"),
            opp("  hbcu research grant ", "https://b/2"),
            opp("", "https://c/3"),
            opp("Another HBCU Grant", "https://d/4"),
        ];
        let mut book = MemoryWorkbook::default();
        let outcome = SyncEngine::new(&cfg, ymd(2025, 6, 1)).sync(&records, &Selection::All, &mut book);

        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.skipped_existing, 2);
        assert_eq!(outcome.proposal_ids, vec!["GSU-P-0001", "GSU-P-0002"]);
        assert_eq!(book.tasks.len(), 14);
        assert_eq!(book.tasks[7].task_id, "TSK-0008");
        assert_eq!(book.tasks[7].proposal_id, "GSU-P-0002");
    }

    #[test]
    fn existing_rows_seed_counters_and_block_titles() {
        let cfg = config();
        let mut book = MemoryWorkbook {
            seeded: vec![
                ExistingProposal {
                    proposal_id: "GSU-P-0001".into(),
                    title: "Old HBCU Grant".into(),
                },
                ExistingProposal {
                    proposal_id: "GSU-P-0003".into(),
                    title: "Older Grant".into(),
                },
            ],
            seeded_task_ids: vec!["TSK-0012".into()],
            ..Default::default()
        };
        let records = vec![opp("old hbcu grant", "u1"), opp("New HBCU Grant", "u2")];
        let outcome = SyncEngine::new(&cfg, ymd(2025, 6, 1)).sync(&records, &Selection::All, &mut book);

        assert_eq!(outcome.proposal_ids, vec!["GSU-P-0004"]);
        assert_eq!(book.tasks[0].task_id, "TSK-0013");
    }

    #[test]
    fn keyword_selection_scans_whole_record() {
        let cfg = config();
        let selection = Selection::from_flags(false, Some("tribal, EPSCoR"), &cfg);
        let mut hit = opp("Infrastructure grant", "u1");
        hit.eligibility = "Tribal colleges".into();
        let miss = opp("Infrastructure grant", "u2");
        assert!(selection.matches(&hit));
        assert!(!selection.matches(&miss));
    }

    #[test]
    fn all_flag_wins_and_empty_filter_uses_config_keywords() {
        let cfg = config();
        assert_eq!(Selection::from_flags(true, Some("HBCU"), &cfg), Selection::All);
        assert_eq!(
            Selection::from_flags(false, Some(" , "), &cfg),
            Selection::Keywords(vec!["hbcu".into(), "msi".into()])
        );
    }

    #[test]
    fn no_keywords_anywhere_selects_nothing_and_still_syncs() {
        let mut bare = config();
        bare.keywords.clear();
        let selection = Selection::from_flags(false, None, &bare);
        assert_eq!(selection, Selection::Keywords(Vec::new()));

        let mut book = MemoryWorkbook::default();
        let records = vec![opp("HBCU Research Grant", "u1")];
        let outcome = SyncEngine::new(&bare, ymd(2025, 6, 1)).sync(&records, &selection, &mut book);
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.candidates, 0);
        assert!(book.proposals.is_empty());
    }

    #[test]
    fn config_requires_default_pi() {
        let err = SyncConfig::from_yaml_str("keywords: [HBCU]\n", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn checked_in_config_loads() {
        let cfg = SyncConfig::load(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../brassloom_config.yaml"))
            .unwrap();
        assert_eq!(cfg.internal_deadline_offset_days, 7);
        assert_eq!(cfg.mechanism_map.get("NIH").map(String::as_str), Some("NIH ASSIST"));
        assert!(!cfg.keywords.is_empty());
    }
}
