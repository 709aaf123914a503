use std::path::Path;

use geopipe_retry::{AttemptOutcome, RetryExecutor};
use geopipe_transport::TransportError;
use geopipe_types::{RawArtifact, SourceDescriptor};

use super::{host_of, HandlerContext, HandlerError, HandlerItemOutcome};

/// Downloads one resource per `include` entry, or the source's bare `url`
/// when `include` is absent. Archives are kept as archive artifacts;
/// expansion happens in staging, not here.
pub struct DirectFileHandler;

impl DirectFileHandler {
    pub fn fetch(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        downloads_root: &Path,
    ) -> Result<Vec<HandlerItemOutcome>, HandlerError> {
        let dest_dir = downloads_root.join(&source.authority).join(&source.id);
        let host = host_of(&source.url);
        let force_download = source.extra_bool("force_download", false);

        let targets: Vec<String> = if source.include.is_empty() {
            vec![source.url.clone()]
        } else {
            source
                .include
                .0
                .iter()
                .map(|entry| format!("{}/{entry}", source.url.trim_end_matches('/')))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for url in targets {
            if !force_download {
                if let Some(guessed_name) = url.rsplit('/').next().filter(|n| n.contains('.')) {
                    if dest_dir.join(guessed_name).exists() {
                        outcomes.push(HandlerItemOutcome::Skipped(format!(
                            "{guessed_name} already present, skipping (force_download not set)"
                        )));
                        continue;
                    }
                }
            }

            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
            let result = executor.run(&host, "direct_file", ctx.cancel, |_attempt| {
                match ctx
                    .transport
                    .download_to_file(&url, &[], &dest_dir, "", ctx.cancel)
                {
                    Ok(path) => AttemptOutcome::Success(path),
                    Err(TransportError::Status { status, retry_after })
                        if status == 429 || (500..600).contains(&status) =>
                    {
                        AttemptOutcome::Retry { retry_after }
                    }
                    Err(TransportError::Cancelled) => AttemptOutcome::Fatal,
                    Err(_) => AttemptOutcome::Retry { retry_after: None },
                }
            });

            match result {
                Ok(path) => {
                    let mut artifact = RawArtifact::new(&source.id, path, source.staged_kind);
                    // A plain file drop has no server-side query surface to filter
                    // on; note that any configured bbox is deferred to the loader.
                    artifact.bbox_deferred = ctx.bbox.is_some();
                    outcomes.push(HandlerItemOutcome::Produced(artifact));
                }
                Err(failure) => {
                    outcomes.push(HandlerItemOutcome::Failed(format!("{url}: {failure:?}")))
                }
            }
        }

        Ok(outcomes)
    }
}
