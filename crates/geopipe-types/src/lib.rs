//! # geopipe-types
//!
//! Core domain types shared by every crate in the geopipe ingestion engine:
//! [`SourceDescriptor`] and [`GlobalSettings`] (produced by the config loader),
//! [`RawArtifact`] (produced by extract handlers), [`StagedEntry`] (produced by
//! the staging materializer), and the event/outcome types consumed by the run
//! summary.
//!
//! Durations are accepted as either a human-readable string (`"30s"`, `"2m"`)
//! or a millisecond integer when deserializing, and always serialized as
//! milliseconds so configuration files stay editable by hand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Shared cancellation flag threaded through the orchestrator, the
/// transport, and the retry policy. Cloning shares the same underlying
/// flag; `cancel()` wakes any thread blocked in [`CancellationToken::sleep`].
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar, AtomicBool)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new(), AtomicBool::new(false))),
        }
    }

    pub fn cancel(&self) {
        let (lock, cvar, flag) = &*self.inner;
        flag.store(true, Ordering::SeqCst);
        let mut cancelled = lock.lock().unwrap();
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.2.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early (and returning immediately) if
    /// cancellation is signaled partway through.
    pub fn sleep(&self, dur: Duration) {
        let (lock, cvar, _) = &*self.inner;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout_while(guard, dur, |cancelled| !*cancelled);
    }
}

/// Deserialize a [`Duration`] from either a human-readable string or a
/// millisecond integer.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a [`Duration`] as milliseconds so it round-trips with
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The protocol family a [`SourceDescriptor`] speaks, selecting which
/// extract handler dispatches for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A single downloadable resource (optionally an archive), fetched as-is.
    #[serde(alias = "file")]
    DirectFile,
    /// An Atom/RSS-style feed whose entries enumerate enclosure links.
    #[serde(rename = "atom_feed")]
    Feed,
    /// A tiled REST query service (ArcGIS-style) with numbered layers.
    #[serde(rename = "rest_api")]
    TiledQuery,
    /// A standards-based tiled collection API (OGC API - Features style).
    #[serde(rename = "ogc_api")]
    TiledCollection,
}

/// The artifact family staging expects to produce for a source, selecting
/// which validator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedKind {
    /// A zip (or similar) archive containing a split vector format, e.g. shapefile.
    #[serde(rename = "shapefile_collection", alias = "archive-of-split-vector")]
    ArchiveOfSplitVector,
    /// An uncompressed split vector format already present as sibling files on disk.
    #[serde(alias = "split-vector")]
    SplitVector,
    /// A single-file container holding one or more named feature classes (e.g. GeoPackage).
    #[serde(rename = "gpkg", alias = "container-vector")]
    ContainerVector,
    /// A JSON feature collection or single feature.
    #[serde(rename = "geojson", alias = "json", alias = "json-vector")]
    JsonVector,
}

/// A rectangular geographic filter with an accompanying CRS identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub crs: String,
}

impl BBox {
    /// `EPSG:4326` is the default CRS the loader assumes for bboxes when a
    /// source does not declare its own.
    pub const WGS84: &'static str = "EPSG:4326";

    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64, crs: impl Into<String>) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            crs: crs.into(),
        }
    }

    /// A bbox is well-formed when each axis's minimum does not exceed its maximum.
    pub fn is_well_formed(&self) -> bool {
        self.xmin <= self.xmax && self.ymin <= self.ymax
    }

    /// Render as a comma-separated `xmin,ymin,xmax,ymax` string, the shape
    /// both TiledQuery and TiledCollection endpoints expect on the wire.
    pub fn to_query_string(&self) -> String {
        format!("{},{},{},{}", self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

/// An allow-list of sub-resources to extract from a source. The concrete
/// meaning (layer IDs, collection IDs, or archive-member stems) is decided by
/// the handler dispatched for the source's [`SourceKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Include(pub Vec<String>);

impl Include {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse entries as ArcGIS-style numeric layer IDs, skipping anything that
    /// doesn't parse (a config error already rejected non-numeric entries for
    /// TiledQuery sources at load time; this is the handler-side accessor).
    pub fn as_layer_ids(&self) -> Vec<i64> {
        self.0.iter().filter_map(|s| s.parse().ok()).collect()
    }

    /// Parse entries as OGC API collection IDs (the raw strings themselves).
    pub fn as_collection_ids(&self) -> &[String] {
        &self.0
    }
}

/// An immutable, validated description of one ingestion source, produced by
/// the config loader and consumed by the orchestrator and its handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Stable identifier: `sanitize(authority + "_" + name)`.
    pub id: String,
    /// Free-form human name; may contain non-ASCII characters.
    pub name: String,
    /// Short tag grouping this source's outputs (e.g. `NVV`, `LST`).
    pub authority: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub staged_kind: StagedKind,
    #[serde(default)]
    pub include: Include,
    #[serde(default)]
    pub bbox: Option<BBox>,
    /// Unknown/handler-specific keys from the inventory record, preserved
    /// verbatim for handlers to parse lazily (`page_size`, `where_clause`, …).
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl SourceDescriptor {
    /// Fetch a string-valued key from `extra`, falling back to `default`.
    pub fn extra_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.extra
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
    }

    /// Fetch an integer-valued key from `extra`, falling back to `default`.
    pub fn extra_u64(&self, key: &str, default: u64) -> u64 {
        self.extra
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    /// Fetch a boolean-valued key from `extra`, falling back to `default`.
    pub fn extra_bool(&self, key: &str, default: bool) -> bool {
        self.extra
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

/// Retry/backoff knobs shared by every handler class, parsed from the global
/// settings document under `[retry]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(
        default = "default_breaker_cooldown",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub circuit_breaker_timeout: Duration,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            timeout: default_timeout(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_timeout: default_breaker_cooldown(),
        }
    }
}

/// `[processing]` knobs from the global settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSettings {
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(
        default = "default_source_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub source_timeout: Duration,
    #[serde(default = "default_max_pipeline_failures")]
    pub max_pipeline_failures: usize,
    #[serde(default = "default_host_concurrency")]
    pub per_host_concurrency: usize,
}

fn default_parallel_workers() -> usize {
    4
}
fn default_memory_limit_mb() -> u64 {
    512
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_source_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_max_pipeline_failures() -> usize {
    5
}
fn default_host_concurrency() -> usize {
    4
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            memory_limit_mb: default_memory_limit_mb(),
            chunk_size: default_chunk_size(),
            source_timeout: default_source_timeout(),
            max_pipeline_failures: default_max_pipeline_failures(),
            per_host_concurrency: default_host_concurrency(),
        }
    }
}

/// `[paths]` knobs from the global settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    pub downloads: PathBuf,
    pub staging: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            downloads: PathBuf::from("./downloads"),
            staging: PathBuf::from("./staging"),
        }
    }
}

/// `[logging]` knobs from the global settings document. The engine itself
/// only reads `level`; the rest is carried through opaquely for the CLI's
/// `Reporter` to honor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The top-level, validated global settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub processing: ProcessingSettings,
    #[serde(default)]
    pub use_bbox_filter: bool,
    #[serde(default)]
    pub global_ogc_bbox_coords: Option<[f64; 4]>,
    #[serde(default = "default_bbox_crs_uri")]
    pub global_ogc_bbox_crs_uri: String,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub cleanup_downloads_before_run: bool,
    #[serde(default)]
    pub cleanup_staging_before_run: bool,
    /// Authorities for which the TiledCollection handler's projected-vs-
    /// geographic CRS override heuristic is allowed to trigger. Empty by
    /// default: the override is opt-in per authority, never automatic.
    #[serde(default)]
    pub crs_override_authorities: Vec<String>,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_bbox_crs_uri() -> String {
    "http://www.opengis.net/def/crs/EPSG/0/4326".to_string()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            logging: LoggingSettings::default(),
            retry: RetrySettings::default(),
            processing: ProcessingSettings::default(),
            use_bbox_filter: false,
            global_ogc_bbox_coords: None,
            global_ogc_bbox_crs_uri: default_bbox_crs_uri(),
            paths: PathSettings::default(),
            cleanup_downloads_before_run: false,
            cleanup_staging_before_run: false,
            crs_override_authorities: Vec::new(),
        }
    }
}

impl GlobalSettings {
    /// Resolve the effective bbox for a source: the source's own bbox when
    /// set, otherwise the global bbox when the toggle is on.
    pub fn effective_bbox(&self, source: &SourceDescriptor) -> Option<BBox> {
        if source.bbox.is_some() {
            return source.bbox.clone();
        }
        if !self.use_bbox_filter {
            return None;
        }
        let [xmin, ymin, xmax, ymax] = self.global_ogc_bbox_coords?;
        Some(BBox::new(xmin, ymin, xmax, ymax, BBox::WGS84))
    }
}

/// An opaque `staged_id -> {dataset, feature_name}` mapping for the
/// downstream loader; the core only carries these through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameMapping {
    pub staging_fc: String,
    pub sde_fc: String,
    pub sde_dataset: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
}

/// One inventory record the config loader rejected, with enough context for
/// an operator to fix the source file without re-running the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub raw_index: usize,
    pub name_if_known: Option<String>,
    pub reason: String,
}

/// What the config loader did with the inventory: which sources were
/// accepted, and why any others were dropped. The load never aborts on a
/// per-source validation failure; this report is how an operator finds out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigLoadReport {
    pub accepted: Vec<SourceDescriptor>,
    pub rejected: Vec<RejectedRecord>,
}

/// The format a handler claims to have produced. Mirrors [`StagedKind`] but
/// is attached per-artifact, since one source can in principle mix formats
/// (a feed that flattens some archives but not others).
pub type DeclaredFormat = StagedKind;

/// A raw, unvalidated fetch result: owned by the handler until handed to
/// staging.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub source_id: String,
    pub sub_resource_id: Option<String>,
    pub payload_path: PathBuf,
    pub declared_format: DeclaredFormat,
    pub declared_crs: Option<String>,
    /// Set when the handler could not apply a bbox filter server-side and is
    /// deferring it to the downstream loader (§4.5 shared conventions).
    pub bbox_deferred: bool,
    /// Set when a handler exhausted retries on some (but not all) pages/entries.
    pub partial: bool,
}

impl RawArtifact {
    pub fn new(source_id: impl Into<String>, payload_path: PathBuf, format: DeclaredFormat) -> Self {
        Self {
            source_id: source_id.into(),
            sub_resource_id: None,
            payload_path,
            declared_format: format,
            declared_crs: None,
            bbox_deferred: false,
            partial: false,
        }
    }

    pub fn with_sub_resource(mut self, id: impl Into<String>) -> Self {
        self.sub_resource_id = Some(id.into());
        self
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.declared_crs = Some(crs.into());
        self
    }
}

/// The dominant geometry kind observed in a JSON-vector artifact, attached
/// to its [`StagedEntry`] so downstream loaders don't have to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
    Mixed,
}

/// A validated, canonically-named artifact ready for the downstream spatial
/// loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedEntry {
    pub source_id: String,
    pub authority: String,
    pub canonical_name: String,
    pub path: PathBuf,
    pub format: StagedKind,
    pub crs: Option<String>,
    pub feature_count: Option<u64>,
    pub dominant_geometry: Option<GeometryKind>,
    pub partial: bool,
}

/// The phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Download,
    Stage,
}

/// The terminal status of one event within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Skipped,
    Failed,
}

/// One append-only record in the run summary's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub phase: Phase,
    pub status: EventStatus,
    pub detail: String,
}

/// The outcome of one artifact's lifecycle (produced by a handler, resolved
/// by staging). Distinct from [`SourceOutcome`] so per-artifact and
/// per-source results are never collapsed into a single boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Staged,
    Skipped,
    Failed,
}

/// The terminal outcome of one source's whole extract+stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Every artifact staged successfully.
    Ok,
    /// At least one artifact staged and at least one failed.
    Partial,
    /// No artifact staged successfully.
    Failed,
    /// The run was cancelled before the source finished.
    SkippedCancelled,
}

/// Per-source totals plus the aggregate run totals, returned by
/// `RunSummary::finalize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub downloaded: usize,
    pub staged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub partial: usize,
}

/// A fully reduced run summary: per-source outcomes plus aggregate totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReduction {
    pub per_source: BTreeMap<String, SourceOutcome>,
    pub totals: RunTotals,
    pub wall_seconds: f64,
}
