use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use brassloom_adapters::HarvestQuery;
use brassloom_harvest::{parse_keyword_list, run_harvest, HarvestConfig, DEFAULT_KEYWORDS};
use brassloom_sync::{run_sync, Selection, SyncConfig};
use clap::{Parser, Subcommand};
use tokio::process::Command;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

const ORCHESTRATOR_KEYWORDS: &str =
    "HBCU,MSI,minority serving,HSI,Tribal,TCU,Black,broadening participation,EPSCoR";

#[derive(Debug, Parser)]
#[command(name = "brassloom")]
#[command(about = "BrassLoom grant harvester and pre-award workbook sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest, then sync the result into the tracking workbook.
    Run {
        #[arg(long, default_value_t = 60)]
        days: i64,
        #[arg(long, default_value = ORCHESTRATOR_KEYWORDS)]
        keywords: String,
        #[arg(long, default_value = "opportunities.json")]
        out: PathBuf,
        #[arg(long, default_value = "GSU_Cayuse_Lite.xlsx")]
        gsu: PathBuf,
        #[arg(long = "sync_filter", alias = "sync-filter", default_value = "")]
        sync_filter: String,
        #[arg(long, default_value = "brassloom_config.yaml")]
        config: PathBuf,
        #[arg(long)]
        sources: Option<PathBuf>,
    },
    /// Fetch, score, dedupe and write ranked opportunities.
    Harvest {
        #[arg(long, default_value = "opportunities.json")]
        out: PathBuf,
        #[arg(long, default_value_t = 90)]
        days: i64,
        #[arg(long)]
        keywords: Option<String>,
        #[arg(long)]
        sources: Option<PathBuf>,
    },
    /// Append new opportunities to the Proposals and Tasks sheets.
    Sync {
        #[arg(long, default_value = "opportunities.json")]
        ops: PathBuf,
        #[arg(long, default_value = "GSU_Cayuse_Lite.xlsx")]
        wb: PathBuf,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "brassloom_config.yaml")]
        config: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            days,
            keywords,
            out,
            gsu,
            sync_filter,
            config,
            sources,
        } => orchestrate(days, &keywords, &out, &gsu, &sync_filter, &config, sources.as_deref()).await,
        Commands::Harvest {
            out,
            days,
            keywords,
            sources,
        } => {
            let keywords = match keywords {
                Some(raw) => parse_keyword_list(&raw),
                None => DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            };
            let mut config = HarvestConfig::from_env();
            if let Some(path) = sources {
                config.sources_path = path;
            }
            let query = HarvestQuery::new(days, keywords, chrono::Utc::now().date_naive());
            let summary = run_harvest(&config, &query, &out).await?;
            if !summary.failed_sources.is_empty() {
                info!(failed = ?summary.failed_sources, "some sources were skipped");
            }
            println!("Wrote {} items to {}", summary.written_records, summary.out_path);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            ops,
            wb,
            filter,
            all,
            config,
        } => {
            let config = SyncConfig::load(&config)?;
            let selection = Selection::from_flags(all, filter.as_deref(), &config);
            let today = chrono::Local::now().date_naive();
            let outcome = run_sync(&ops, &wb, &selection, &config, today).await?;
            let name = wb
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| wb.display().to_string());
            println!("Imported {} opportunities into {}", outcome.imported, name);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run `harvest` then `sync` as child processes of this same binary. A failed
/// harvest stops the sequence and its exit code is returned as ours.
async fn orchestrate(
    days: i64,
    keywords: &str,
    out: &Path,
    gsu: &Path,
    sync_filter: &str,
    config: &Path,
    sources: Option<&Path>,
) -> Result<ExitCode> {
    let exe = std::env::current_exe().context("locating the brassloom executable")?;

    let mut harvest = Command::new(&exe);
    harvest.args(harvest_args(days, keywords, out, sources));
    if let Some(code) = run_step("harvest", &mut harvest).await? {
        return Ok(code);
    }

    let mut sync = Command::new(&exe);
    sync.args(sync_args(out, gsu, sync_filter, config));
    if let Some(code) = run_step("sync", &mut sync).await? {
        return Ok(code);
    }

    Ok(ExitCode::SUCCESS)
}

fn harvest_args(days: i64, keywords: &str, out: &Path, sources: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "harvest".into(),
        "--out".into(),
        out.into(),
        "--days".into(),
        days.to_string().into(),
        "--keywords".into(),
        keywords.into(),
    ];
    if let Some(path) = sources {
        args.push("--sources".into());
        args.push(path.into());
    }
    args
}

/// The harvest output feeds sync. A blank filter means `--all`.
fn sync_args(out: &Path, gsu: &Path, sync_filter: &str, config: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "sync".into(),
        "--ops".into(),
        out.into(),
        "--wb".into(),
        gsu.into(),
        "--config".into(),
        config.into(),
    ];
    if sync_filter.trim().is_empty() {
        args.push("--all".into());
    } else {
        args.push("--filter".into());
        args.push(sync_filter.into());
    }
    args
}

/// `Some(code)` when the child failed.
async fn run_step(step: &str, command: &mut Command) -> Result<Option<ExitCode>> {
    info!(step, "starting step");
    let status = command
        .status()
        .await
        .with_context(|| format!("spawning {step} step"))?;
    if status.success() {
        return Ok(None);
    }
    let code = status.code().unwrap_or(1);
    error!(step, code, "step failed; aborting");
    let code = u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1);
    Ok(Some(ExitCode::from(code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn harvest_step_forwards_window_keywords_and_registry() {
        let args = harvest_args(60, "HBCU,MSI", Path::new("ops.json"), Some(Path::new("reg.yaml")));
        assert_eq!(
            strings(&args),
            vec!["harvest", "--out", "ops.json", "--days", "60", "--keywords", "HBCU,MSI", "--sources", "reg.yaml"]
        );
        let bare = harvest_args(90, "HBCU", Path::new("ops.json"), None);
        assert!(!strings(&bare).contains(&"--sources".to_string()));
    }

    #[test]
    fn sync_step_reads_harvest_output_and_picks_selection_mode() {
        let filtered = sync_args(Path::new("ops.json"), Path::new("wb.xlsx"), "HBCU", Path::new("cfg.yaml"));
        assert_eq!(
            strings(&filtered),
            vec!["sync", "--ops", "ops.json", "--wb", "wb.xlsx", "--config", "cfg.yaml", "--filter", "HBCU"]
        );

        let all = strings(&sync_args(Path::new("ops.json"), Path::new("wb.xlsx"), "  ", Path::new("cfg.yaml")));
        assert_eq!(all.last().map(String::as_str), Some("--all"));
        assert!(!all.contains(&"--filter".to_string()));
    }

    #[test]
    fn orchestrator_step_args_parse_as_subcommands() {
        let sync = sync_args(Path::new("ops.json"), Path::new("wb.xlsx"), "", Path::new("cfg.yaml"));
        let parsed = Cli::try_parse_from(std::iter::once(OsString::from("brassloom")).chain(sync)).unwrap();
        assert!(matches!(parsed.command, Commands::Sync { all: true, filter: None, .. }));

        let harvest = harvest_args(60, "HBCU", Path::new("ops.json"), None);
        let parsed = Cli::try_parse_from(std::iter::once(OsString::from("brassloom")).chain(harvest)).unwrap();
        assert!(matches!(parsed.command, Commands::Harvest { days: 60, .. }));
    }

    #[test]
    fn sync_workbook_defaults_to_tracking_file() {
        let parsed = Cli::try_parse_from(["brassloom", "sync", "--all"]).unwrap();
        match parsed.command {
            Commands::Sync { wb, ops, .. } => {
                assert_eq!(wb, PathBuf::from("GSU_Cayuse_Lite.xlsx"));
                assert_eq!(ops, PathBuf::from("opportunities.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
