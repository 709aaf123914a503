//! Run orchestrator: dispatches enabled sources across a fixed worker pool,
//! enforces per-source deadlines and a global partial-failure budget, and
//! reduces the whole run into a [`RunReduction`] plus staged entries.
//!
//! Mirrors the teacher's `engine_parallel` shape (a shared `Reporter`, an
//! append-only event log, `std::sync` primitives over external concurrency
//! crates) but dispatches through a fixed-size worker pool pulling from a
//! shared `mpsc::Receiver`, per §5 of the ingestion engine's concurrency
//! model, rather than the teacher's per-wave `thread::spawn` + `chunks`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use geopipe_events::RunEventLog;
use geopipe_retry::{CircuitBreakerTable, RetryStrategyConfig, RetryStrategyType};
use geopipe_staging::{self, NameRegistry};
use geopipe_transport::HttpTransport;
use geopipe_types::{
    EventStatus, GlobalSettings, Phase, RetrySettings, RunReduction, SourceDescriptor, SourceOutcome,
    StagedEntry,
};

use crate::handlers::{self, HandlerContext, HandlerError, HandlerItemOutcome};
use crate::reporter::Reporter;

/// Convert the config document's retry knobs into the policy shape
/// `geopipe-retry` runs. `backoff_factor` <= 1.0 degenerates to a linear
/// backoff (a factor that never grows the delay isn't meaningfully
/// exponential); otherwise it feeds `calculate_delay`'s exponential branch
/// directly.
fn retry_config_from_settings(settings: &RetrySettings) -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: if settings.backoff_factor <= 1.0 {
            RetryStrategyType::Linear
        } else {
            RetryStrategyType::Exponential
        },
        max_attempts: settings.max_attempts,
        base_delay: settings.base_delay,
        backoff_factor: settings.backoff_factor,
        max_delay: settings.max_delay,
        jitter: 0.5,
        breaker_threshold: settings.circuit_breaker_threshold,
        breaker_cooldown: settings.circuit_breaker_timeout,
    }
}

/// Everything one `run` produced: the reduced summary, the populated event
/// log behind it (for persisting the full forensic trail, not just the
/// reduction), and every successfully staged entry.
pub struct RunOutcome {
    pub reduction: RunReduction,
    pub events: RunEventLog,
    pub staged: Vec<StagedEntry>,
}

/// Run every enabled source in `sources` to completion (or cancellation).
///
/// `global_cancel` is owned by the caller so a signal handler (SIGINT/
/// SIGTERM, per §6) can trigger it from outside the run without the
/// orchestrator needing to know about signals itself.
#[allow(clippy::too_many_arguments)]
pub fn run(
    sources: &[SourceDescriptor],
    settings: &GlobalSettings,
    transport: Arc<HttpTransport>,
    downloads_root: &Path,
    staging_root: &Path,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
    global_cancel: geopipe_types::CancellationToken,
) -> RunOutcome {
    let enabled: Vec<SourceDescriptor> = sources.iter().filter(|s| s.enabled).cloned().collect();
    let retry_config = retry_config_from_settings(&settings.retry);
    let breakers = Arc::new(CircuitBreakerTable::new());
    let registry = Arc::new(NameRegistry::new());

    let worker_count = settings.processing.parallel_workers.max(1).min(enabled.len().max(1));

    reporter.lock().unwrap().info(&format!(
        "starting run: {} enabled sources, {} workers",
        enabled.len(),
        worker_count
    ));

    // A bounded channel of sources, per the concurrency model: workers are
    // long-lived and pull work rather than being respawned per wave.
    let (job_tx, job_rx) = mpsc::sync_channel::<SourceDescriptor>(worker_count);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, result_rx) = mpsc::channel::<SourceResult>();

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let transport = Arc::clone(&transport);
        let breakers = Arc::clone(&breakers);
        let registry = Arc::clone(&registry);
        let settings = settings.clone();
        let retry_config = retry_config.clone();
        let downloads_root = downloads_root.to_path_buf();
        let staging_root = staging_root.to_path_buf();
        let global_cancel = global_cancel.clone();
        let reporter = Arc::clone(&reporter);

        let handle = thread::spawn(move || loop {
            let job = {
                let rx = job_rx.lock().unwrap();
                rx.recv()
            };
            let Ok(source) = job else { break };

            if global_cancel.is_cancelled() {
                let _ = result_tx.send(SourceResult {
                    source_id: source.id.clone(),
                    outcome: SourceOutcome::SkippedCancelled,
                    events: vec![(Phase::Download, EventStatus::Skipped, "run cancelled".to_string())],
                    staged: Vec::new(),
                });
                continue;
            }

            reporter.lock().unwrap().info(&format!("{}: starting", source.id));
            let result = process_source(
                &source,
                &settings,
                &transport,
                &retry_config,
                &breakers,
                &registry,
                &downloads_root,
                &staging_root,
                &global_cancel,
            );
            match result.outcome {
                SourceOutcome::Ok => reporter.lock().unwrap().info(&format!("{}: ok", source.id)),
                SourceOutcome::Partial => {
                    reporter.lock().unwrap().warn(&format!("{}: partial", source.id))
                }
                SourceOutcome::Failed => {
                    reporter.lock().unwrap().error(&format!("{}: failed", source.id))
                }
                SourceOutcome::SkippedCancelled => {
                    reporter.lock().unwrap().warn(&format!("{}: cancelled", source.id))
                }
            }

            let _ = result_tx.send(result);
        });
        handles.push(handle);
    }
    drop(result_tx);

    for source in &enabled {
        if job_tx.send(source.clone()).is_err() {
            break;
        }
    }
    drop(job_tx);

    let mut log = RunEventLog::new();
    let mut staged_all = Vec::new();
    let mut failed_sources = 0usize;

    for _ in 0..enabled.len() {
        let Ok(result) = result_rx.recv() else { break };
        for (phase, status, detail) in result.events {
            log.record(result.source_id.clone(), phase, status, detail);
        }
        log.set_outcome(result.source_id.clone(), result.outcome);
        staged_all.extend(result.staged);

        if matches!(result.outcome, SourceOutcome::Failed) {
            failed_sources += 1;
            if failed_sources > settings.processing.max_pipeline_failures {
                reporter.lock().unwrap().error(
                    "max pipeline failures exceeded, cancelling remaining sources",
                );
                global_cancel.cancel();
            }
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    let reduction = log.finalize();
    reporter.lock().unwrap().info(&format!(
        "run finished: {} staged, {} failed, {} partial",
        reduction.totals.staged, reduction.totals.failed, reduction.totals.partial
    ));

    RunOutcome {
        reduction,
        events: log,
        staged: staged_all,
    }
}

struct SourceResult {
    source_id: String,
    outcome: SourceOutcome,
    events: Vec<(Phase, EventStatus, String)>,
    staged: Vec<StagedEntry>,
}

#[allow(clippy::too_many_arguments)]
fn process_source(
    source: &SourceDescriptor,
    settings: &GlobalSettings,
    transport: &HttpTransport,
    retry_config: &RetryStrategyConfig,
    breakers: &CircuitBreakerTable,
    registry: &NameRegistry,
    downloads_root: &Path,
    staging_root: &Path,
    global_cancel: &geopipe_types::CancellationToken,
) -> SourceResult {
    let per_source_cancel = geopipe_types::CancellationToken::new();
    let done = Arc::new(AtomicBool::new(false));
    let deadline = settings.processing.source_timeout;

    let watchdog = {
        let done = Arc::clone(&done);
        let per_source_cancel = per_source_cancel.clone();
        let global_cancel = global_cancel.clone();
        thread::spawn(move || {
            let start = Instant::now();
            while !done.load(Ordering::SeqCst) {
                if global_cancel.is_cancelled() || start.elapsed() > deadline {
                    per_source_cancel.cancel();
                    return;
                }
                thread::sleep(Duration::from_millis(200));
            }
        })
    };

    let bbox = settings.effective_bbox(source);
    let ctx = HandlerContext {
        transport,
        retry_config: retry_config.clone(),
        breakers,
        cancel: &per_source_cancel,
        bbox: bbox.as_ref(),
        crs_override_authorities: &settings.crs_override_authorities,
    };

    let mut events = Vec::new();
    let mut staged = Vec::new();
    let mut any_staged = false;
    let mut any_failed = false;

    let outcome = match handlers::fetch(&ctx, source, downloads_root) {
        Err(HandlerError::Cancelled) => SourceOutcome::SkippedCancelled,
        Err(e) => {
            events.push((Phase::Download, EventStatus::Failed, e.to_string()));
            SourceOutcome::Failed
        }
        Ok(item_outcomes) => {
            for item in item_outcomes {
                match item {
                    HandlerItemOutcome::Produced(artifact) => {
                        events.push((Phase::Download, EventStatus::Ok, format!("{:?}", artifact.payload_path)));
                        match geopipe_staging::stage_artifact(
                            &artifact,
                            &source.authority,
                            &source.include,
                            registry,
                            staging_root,
                        ) {
                            Ok(entries) => {
                                for entry in entries {
                                    events.push((
                                        Phase::Stage,
                                        EventStatus::Ok,
                                        entry.canonical_name.clone(),
                                    ));
                                    staged.push(entry);
                                }
                                any_staged = true;
                            }
                            Err(e) => {
                                let _ = geopipe_staging::write_bad_sidecar(&artifact.payload_path, &e);
                                events.push((Phase::Stage, EventStatus::Failed, e.to_string()));
                                any_failed = true;
                            }
                        }
                    }
                    HandlerItemOutcome::Skipped(detail) => {
                        events.push((Phase::Download, EventStatus::Skipped, detail));
                    }
                    HandlerItemOutcome::Failed(detail) => {
                        events.push((Phase::Download, EventStatus::Failed, detail));
                        any_failed = true;
                    }
                }
            }

            match (any_staged, any_failed) {
                (true, false) => SourceOutcome::Ok,
                (true, true) => SourceOutcome::Partial,
                (false, true) => SourceOutcome::Failed,
                (false, false) => SourceOutcome::Ok,
            }
        }
    };

    // A source cancelled mid-pagination may still have finalized a partial
    // artifact (features collected so far, `partial=true`) — it staged
    // something, but the run's verdict on it is cancellation, not success.
    let outcome = if per_source_cancel.is_cancelled() && !matches!(outcome, SourceOutcome::SkippedCancelled) {
        events.push((Phase::Download, EventStatus::Skipped, "cancelled mid-pagination".to_string()));
        SourceOutcome::SkippedCancelled
    } else {
        outcome
    };

    done.store(true, Ordering::SeqCst);
    let _ = watchdog.join();

    SourceResult {
        source_id: source.id.clone(),
        outcome,
        events,
        staged,
    }
}
