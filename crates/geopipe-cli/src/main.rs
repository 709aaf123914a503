use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use geopipe::orchestrator;
use geopipe::reporter::Reporter;
use geopipe_events::events_path;
use geopipe_transport::HttpTransport;
use geopipe_types::SourceOutcome;

#[derive(Parser, Debug)]
#[command(name = "geopipe", version)]
#[command(about = "Extracts and stages geospatial datasets from heterogeneous upstream services")]
struct Cli {
    /// Path to the global settings document.
    #[arg(long, default_value = "./config/settings.toml")]
    settings: PathBuf,

    /// Path to the source inventory document.
    #[arg(long, default_value = "./config/sources.toml")]
    sources: PathBuf,

    /// Path to the optional name-mapping overrides document.
    #[arg(long, default_value = "./config/name_mappings.toml")]
    name_mappings: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate configuration, printing the load report without
    /// performing any network I/O.
    Plan,
    /// Run the extract + stage pipeline against every enabled source.
    Run,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Exit codes per the process interface: 0 success/partial-within-budget,
/// 1 configuration error, 2 orchestrator cancellation/timeout, 3 failure
/// budget exceeded.
fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let settings = geopipe_config::load_global_settings(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;
    let report = geopipe_config::load_inventory(&cli.sources)
        .with_context(|| format!("loading {}", cli.sources.display()))?;
    let _name_mappings = geopipe_config::load_name_mappings(&cli.name_mappings)
        .with_context(|| format!("loading {}", cli.name_mappings.display()))?;

    for rejected in &report.rejected {
        eprintln!(
            "[warn] rejected source #{} ({}): {}",
            rejected.raw_index,
            rejected.name_if_known.as_deref().unwrap_or("<unknown>"),
            rejected.reason
        );
    }

    match cli.cmd {
        Commands::Plan => {
            print_plan(&report.accepted);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => {
            let transport = Arc::new(HttpTransport::new(
                settings.retry.timeout,
                settings.processing.per_host_concurrency as u32,
                concat!("geopipe/", env!("CARGO_PKG_VERSION")),
            ));
            let reporter: Arc<Mutex<dyn Reporter + Send>> = Arc::new(Mutex::new(CliReporter));

            std::fs::create_dir_all(&settings.paths.downloads)
                .with_context(|| format!("creating {}", settings.paths.downloads.display()))?;
            std::fs::create_dir_all(&settings.paths.staging)
                .with_context(|| format!("creating {}", settings.paths.staging.display()))?;

            let global_cancel = geopipe_types::CancellationToken::new();
            let signal_cancel = global_cancel.clone();
            ctrlc::set_handler(move || signal_cancel.cancel())
                .context("failed to install SIGINT/SIGTERM handler")?;

            let outcome = orchestrator::run(
                &report.accepted,
                &settings,
                transport,
                &settings.paths.downloads,
                &settings.paths.staging,
                reporter,
                global_cancel,
            );

            let _ = outcome.events.write_to_file(&events_path(&settings.paths.staging));

            print_summary(&outcome.reduction);

            let cancelled = outcome
                .reduction
                .per_source
                .values()
                .any(|o| matches!(o, SourceOutcome::SkippedCancelled));
            if cancelled {
                return Ok(ExitCode::from(2));
            }
            if outcome.reduction.totals.failed > settings.processing.max_pipeline_failures {
                return Ok(ExitCode::from(3));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_plan(accepted: &[geopipe_types::SourceDescriptor]) {
    println!("accepted sources: {}", accepted.len());
    for source in accepted {
        println!(
            "  {} ({:?}, authority={}, enabled={})",
            source.id, source.kind, source.authority, source.enabled
        );
    }
}

fn print_summary(reduction: &geopipe_types::RunReduction) {
    println!("downloaded: {}", reduction.totals.downloaded);
    println!("staged:     {}", reduction.totals.staged);
    println!("skipped:    {}", reduction.totals.skipped);
    println!("failed:     {}", reduction.totals.failed);
    println!("partial:    {}", reduction.totals.partial);
    println!("wall time:  {:.1}s", reduction.wall_seconds);
    println!();
    for (source_id, outcome) in &reduction.per_source {
        println!("{source_id}: {outcome:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }
        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }
        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    #[test]
    fn cli_reporter_methods_are_callable() {
        let mut rep = CliReporter;
        rep.info("info");
        rep.warn("warn");
        rep.error("error");
    }

    #[test]
    fn test_reporter_collects_all_levels() {
        let mut reporter = TestReporter::default();
        reporter.info("i");
        reporter.warn("w");
        reporter.error("e");
        assert_eq!(reporter.infos, vec!["i".to_string()]);
        assert_eq!(reporter.warns, vec!["w".to_string()]);
        assert_eq!(reporter.errors, vec!["e".to_string()]);
    }

    #[test]
    fn run_plan_reports_rejected_and_accepted_sources() {
        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.toml");
        std::fs::write(
            &sources_path,
            r#"
            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "file"
            url = "http://example.invalid/roads.zip"

            [[sources]]
            name = "broken"
            authority = "NVV"
            type = "file"
            "#,
        )
        .unwrap();
        let settings_path = dir.path().join("settings.toml");
        std::fs::write(&settings_path, "").unwrap();

        let cli = Cli {
            settings: settings_path,
            sources: sources_path,
            name_mappings: dir.path().join("name_mappings.toml"),
            cmd: Commands::Plan,
        };

        assert!(run(&cli).is_ok());
    }
}
