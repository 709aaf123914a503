//! Extract handlers: one per [`SourceKind`], each turning a
//! [`SourceDescriptor`] into a sequence of [`RawArtifact`]s.
//!
//! All four share the contract from the orchestrator's point of view:
//! `fetch` never panics on a bad sub-resource — it reports a
//! [`HandlerItemOutcome::Failed`] for that sub-resource and keeps going.
//! `fetch` returns `Err` only for a whole-source failure (the service
//! metadata itself could not be fetched, no target layers/collections
//! resolved, or the run was cancelled).

mod direct_file;
mod feed;
mod tiled_collection;
mod tiled_query;

pub use direct_file::DirectFileHandler;
pub use feed::FeedHandler;
pub use tiled_collection::TiledCollectionHandler;
pub use tiled_query::TiledQueryHandler;

use std::path::Path;

use geopipe_retry::CircuitBreakerTable;
use geopipe_retry::RetryStrategyConfig;
use geopipe_transport::HttpTransport;
use geopipe_types::{BBox, CancellationToken, RawArtifact, SourceDescriptor, SourceKind};

/// Shared, per-run context handed to every handler invocation.
pub struct HandlerContext<'a> {
    pub transport: &'a HttpTransport,
    pub retry_config: RetryStrategyConfig,
    pub breakers: &'a CircuitBreakerTable,
    pub cancel: &'a CancellationToken,
    pub bbox: Option<&'a BBox>,
    /// Authorities allowed to trigger the TiledCollection handler's
    /// projected-vs-geographic CRS override heuristic.
    pub crs_override_authorities: &'a [String],
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse response body: {0}")]
    Parse(String),
    #[error("no target layers or collections resolved for this source")]
    NoTargets,
    #[error("cancelled")]
    Cancelled,
}

/// The per-sub-resource result of one handler invocation.
pub enum HandlerItemOutcome {
    Produced(RawArtifact),
    Skipped(String),
    Failed(String),
}

/// Dispatch the handler matching `source.kind`. `downloads_root` is where raw
/// artifacts land; staging (canonical naming, `.meta` sidecars) is a
/// separate step under a separate root, run afterward by `geopipe-staging`.
pub fn fetch(
    ctx: &HandlerContext,
    source: &SourceDescriptor,
    downloads_root: &Path,
) -> Result<Vec<HandlerItemOutcome>, HandlerError> {
    match source.kind {
        SourceKind::DirectFile => DirectFileHandler.fetch(ctx, source, downloads_root),
        SourceKind::Feed => FeedHandler.fetch(ctx, source, downloads_root),
        SourceKind::TiledQuery => TiledQueryHandler.fetch(ctx, source, downloads_root),
        SourceKind::TiledCollection => TiledCollectionHandler.fetch(ctx, source, downloads_root),
    }
}

/// Host to key the retry policy's circuit breaker and per-host semaphore on.
pub(crate) fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}
