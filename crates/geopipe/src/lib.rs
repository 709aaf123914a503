//! # geopipe
//!
//! A reliability layer for pulling geospatial datasets from heterogeneous
//! upstream services (ArcGIS REST, OGC API - Features, Atom/RSS feeds, plain
//! file drops) into a canonically-named local staging area.
//!
//! geopipe provides deterministic, auditable extraction with per-source
//! retry/backoff, circuit breaking, and partial-failure isolation: one
//! source's outage never blocks its siblings, and a pipeline-wide failure
//! budget decides when the whole run should give up early.
//!
//! ## Pipeline
//!
//! The core flow is **load inventory → extract → stage → summarize**:
//!
//! 1. [`geopipe_config::load_inventory`] reads and validates the source
//!    inventory, rejecting malformed records without aborting the load.
//! 2. [`handlers::fetch`] dispatches the extract handler matching each
//!    source's [`geopipe_types::SourceKind`], producing [`geopipe_types::RawArtifact`]s.
//! 3. [`geopipe_staging::stage_artifact`] validates and canonically names
//!    each artifact into a [`geopipe_types::StagedEntry`].
//! 4. [`orchestrator::run`] ties the above together across a fixed worker
//!    pool, reducing the run into a [`geopipe_types::RunReduction`].
//!
//! ## Modules
//!
//! - [`handlers`] — one extract handler per [`geopipe_types::SourceKind`]
//! - [`orchestrator`] — worker pool dispatch, deadlines, failure budget
//! - [`reporter`] — the progress-reporting trait an adapter implements

/// Extract handlers: one per [`geopipe_types::SourceKind`].
pub mod handlers;

/// Worker pool dispatch, per-source deadlines, and run reduction.
pub mod orchestrator;

/// Progress reporting trait, decoupled from any concrete output sink.
pub mod reporter;

pub use geopipe_retry as retry;
pub use geopipe_types as types;
