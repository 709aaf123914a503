//! Staging materializer: turns a [`RawArtifact`] produced by an extract
//! handler into one or more validated, canonically-named [`StagedEntry`]
//! records.
//!
//! Validation is dispatched on [`StagedKind`]. A malformed or unreadable
//! artifact fails only that artifact — siblings and sibling sources proceed
//! — and [`write_bad_sidecar`] preserves the offending file alongside a
//! `.bad` file summarizing why.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use geopipe_types::{GeometryKind, Include, RawArtifact, StagedEntry, StagedKind};

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no primary member with complete companions found in archive")]
    NoPrimaryMember,
    #[error("container has no feature class matching the include allow-list")]
    NoMatchingFeatureClass,
    #[error("malformed JSON vector: {0}")]
    MalformedJson(String),
}

/// Registry of canonical names already assigned within one staging run.
/// Entries are only ever added, matching the "never removed within a run"
/// invariant; callers share one instance across every worker via `Arc`.
#[derive(Default)]
pub struct NameRegistry {
    used: Mutex<HashSet<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a canonical name for `authority_logicalName`, resolving
    /// collisions against every name reserved so far.
    pub fn reserve(&self, authority: &str, logical_name: &str) -> String {
        let mut used = self.used.lock().unwrap();
        let name = geopipe_naming::canonical_name(authority, logical_name, &used);
        used.insert(name.clone());
        name
    }
}

/// Validate and canonically name a raw artifact, materializing each staged
/// entry under `staging_root/<authority>/<source.id>/<canonicalName>.<ext>`
/// alongside a `.meta` sidecar. `include` gates which feature classes a
/// container-vector artifact stages; it is ignored by the other formats.
pub fn stage_artifact(
    raw: &RawArtifact,
    authority: &str,
    include: &Include,
    registry: &NameRegistry,
    staging_root: &Path,
) -> Result<Vec<StagedEntry>, StagingError> {
    match raw.declared_format {
        StagedKind::ArchiveOfSplitVector => {
            stage_archive_of_split_vector(raw, authority, registry, staging_root)
        }
        StagedKind::SplitVector => stage_split_vector(raw, authority, registry, staging_root),
        StagedKind::ContainerVector => {
            stage_container_vector(raw, authority, include, registry, staging_root)
        }
        StagedKind::JsonVector => stage_json_vector(raw, authority, registry, staging_root),
    }
}

/// Write a `.bad` sidecar next to an artifact's original path, summarizing
/// why staging failed. The offending file is left untouched.
pub fn write_bad_sidecar(artifact_path: &Path, err: &StagingError) -> std::io::Result<()> {
    let sidecar = PathBuf::from(format!("{}.bad", artifact_path.display()));
    let mut file = File::create(sidecar)?;
    writeln!(file, "staging failed: {err}")
}

/// Write the `.meta` sidecar documented in the on-disk staging layout:
/// format, CRS, feature count, and the partial flag as plain text.
fn write_meta_sidecar(dest_path: &Path, entry: &StagedEntry) -> std::io::Result<()> {
    let sidecar = dest_path.with_extension("meta");
    let mut file = File::create(sidecar)?;
    writeln!(file, "format: {:?}", entry.format)?;
    writeln!(file, "crs: {}", entry.crs.as_deref().unwrap_or(""))?;
    writeln!(
        file,
        "feature_count: {}",
        entry.feature_count.map(|n| n.to_string()).unwrap_or_default()
    )?;
    writeln!(file, "partial: {}", entry.partial)
}

fn stage_dest_dir(staging_root: &Path, authority: &str, source_id: &str) -> std::io::Result<PathBuf> {
    let dir = staging_root.join(authority).join(source_id);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn logical_name(raw: &RawArtifact) -> String {
    raw.sub_resource_id.clone().unwrap_or_else(|| raw.source_id.clone())
}

const PRIMARY_EXT: &str = "shp";
const COMPANION_EXTS: [&str; 2] = ["shx", "dbf"];

fn stem_and_ext(name: &str) -> (String, String) {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), ext.to_lowercase()),
        None => (base.to_string(), String::new()),
    }
}

/// `Archive-of-split-vector`: open the archive, find every `.shp` member
/// with both its `.shx` and `.dbf` companions co-located, and extract the
/// whole archive into a flat directory. Each valid primary becomes one
/// `StagedEntry`; an archive with zero valid primaries fails outright.
fn stage_archive_of_split_vector(
    raw: &RawArtifact,
    authority: &str,
    registry: &NameRegistry,
    staging_root: &Path,
) -> Result<Vec<StagedEntry>, StagingError> {
    let file = File::open(&raw.payload_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).map(|f| f.name().to_string()))
        .collect::<Result<_, _>>()?;
    let name_set: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();

    let mut primaries = Vec::new();
    for name in &names {
        let (stem, ext) = stem_and_ext(name);
        if ext != PRIMARY_EXT {
            continue;
        }
        let has_companions = COMPANION_EXTS
            .iter()
            .all(|companion_ext| name_set.contains(&format!("{}.{companion_ext}", stem.to_lowercase())));
        if has_companions {
            primaries.push((name.clone(), stem));
        }
    }

    if primaries.is_empty() {
        return Err(StagingError::NoPrimaryMember);
    }

    let dest_dir = raw
        .payload_path
        .parent()
        .map(|p| p.join("extracted"))
        .unwrap_or_else(|| PathBuf::from("extracted"));
    fs::create_dir_all(&dest_dir)?;

    for name in &names {
        let mut entry = archive.by_name(name)?;
        if entry.is_dir() {
            continue;
        }
        let basename = name.rsplit('/').next().unwrap_or(name);
        let dest_path = dest_dir.join(basename);
        let mut out = File::create(&dest_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    let stage_dir = stage_dest_dir(staging_root, authority, &raw.source_id)?;

    let mut staged = Vec::with_capacity(primaries.len());
    for (_name, stem) in primaries {
        let canonical_name = registry.reserve(authority, &stem);
        let extracted_stem = dest_dir.join(&stem);
        let staged_path = stage_dir.join(format!("{canonical_name}.{PRIMARY_EXT}"));
        fs::copy(extracted_stem.with_extension(PRIMARY_EXT), &staged_path)?;
        for companion_ext in COMPANION_EXTS {
            fs::copy(
                extracted_stem.with_extension(companion_ext),
                stage_dir.join(format!("{canonical_name}.{companion_ext}")),
            )?;
        }

        let entry = StagedEntry {
            source_id: raw.source_id.clone(),
            authority: authority.to_string(),
            canonical_name,
            path: staged_path,
            format: StagedKind::ArchiveOfSplitVector,
            crs: raw.declared_crs.clone(),
            feature_count: None,
            dominant_geometry: None,
            partial: raw.partial,
        };
        write_meta_sidecar(&entry.path, &entry)?;
        staged.push(entry);
    }
    Ok(staged)
}

/// `Split-vector`: the same contract as the archive case, except the
/// members already sit uncompressed on disk as siblings of `payload_path`,
/// so no extraction step runs.
fn stage_split_vector(
    raw: &RawArtifact,
    authority: &str,
    registry: &NameRegistry,
    staging_root: &Path,
) -> Result<Vec<StagedEntry>, StagingError> {
    let dir = if raw.payload_path.is_dir() {
        raw.payload_path.clone()
    } else {
        raw.payload_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    };

    let mut sibling_names = HashSet::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            sibling_names.insert(name.to_lowercase());
        }
    }

    let mut primaries = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let (stem, ext) = stem_and_ext(&name);
        if ext != PRIMARY_EXT {
            continue;
        }
        let has_companions = COMPANION_EXTS
            .iter()
            .all(|companion_ext| sibling_names.contains(&format!("{}.{companion_ext}", stem.to_lowercase())));
        if has_companions {
            primaries.push((name, stem));
        }
    }

    if primaries.is_empty() {
        return Err(StagingError::NoPrimaryMember);
    }

    let stage_dir = stage_dest_dir(staging_root, authority, &raw.source_id)?;

    let mut staged = Vec::with_capacity(primaries.len());
    for (_name, stem) in primaries {
        let canonical_name = registry.reserve(authority, &stem);
        let source_stem = dir.join(&stem);
        let staged_path = stage_dir.join(format!("{canonical_name}.{PRIMARY_EXT}"));
        fs::copy(source_stem.with_extension(PRIMARY_EXT), &staged_path)?;
        for companion_ext in COMPANION_EXTS {
            fs::copy(
                source_stem.with_extension(companion_ext),
                stage_dir.join(format!("{canonical_name}.{companion_ext}")),
            )?;
        }

        let entry = StagedEntry {
            source_id: raw.source_id.clone(),
            authority: authority.to_string(),
            canonical_name,
            path: staged_path,
            format: StagedKind::SplitVector,
            crs: raw.declared_crs.clone(),
            feature_count: None,
            dominant_geometry: None,
            partial: raw.partial,
        };
        write_meta_sidecar(&entry.path, &entry)?;
        staged.push(entry);
    }
    Ok(staged)
}

/// `Container-vector`: open the container read-only, list its tables
/// (feature classes), optionally filter by an `include` allow-list, and
/// retry bare names when a qualified one fails.
fn stage_container_vector(
    raw: &RawArtifact,
    authority: &str,
    include: &Include,
    registry: &NameRegistry,
    staging_root: &Path,
) -> Result<Vec<StagedEntry>, StagingError> {
    let conn = rusqlite::Connection::open_with_flags(
        &raw.payload_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'gpkg_%' AND name NOT LIKE 'rtree_%'",
    )?;
    let table_names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    let allow = include.as_collection_ids();
    let candidates: Vec<&String> = if allow.is_empty() {
        table_names.iter().collect()
    } else {
        table_names
            .iter()
            .filter(|name| allow.iter().any(|a| a == *name || bare_name(a) == bare_name(name)))
            .collect()
    };

    if candidates.is_empty() {
        return Err(StagingError::NoMatchingFeatureClass);
    }

    let (_, container_ext) = stem_and_ext(
        raw.payload_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("container.gpkg"),
    );
    let stage_dir = stage_dest_dir(staging_root, authority, &raw.source_id)?;

    let mut staged = Vec::with_capacity(candidates.len());
    for name in candidates {
        let feature_count = count_rows(&conn, name).or_else(|_| count_rows(&conn, &bare_name(name)))?;
        let canonical_name = registry.reserve(authority, &bare_name(name));
        let staged_path = stage_dir.join(format!("{canonical_name}.{container_ext}"));
        fs::copy(&raw.payload_path, &staged_path)?;

        let entry = StagedEntry {
            source_id: raw.source_id.clone(),
            authority: authority.to_string(),
            canonical_name,
            path: staged_path,
            format: StagedKind::ContainerVector,
            crs: raw.declared_crs.clone(),
            feature_count: Some(feature_count),
            dominant_geometry: None,
            partial: raw.partial,
        };
        write_meta_sidecar(&entry.path, &entry)?;
        staged.push(entry);
    }
    Ok(staged)
}

fn bare_name(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

fn count_rows(conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<u64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
}

/// `JSON-vector`: parse, verify the top-level shape is a feature collection
/// or a single feature, and pre-scan geometry to determine a dominant kind.
fn stage_json_vector(
    raw: &RawArtifact,
    authority: &str,
    registry: &NameRegistry,
    staging_root: &Path,
) -> Result<Vec<StagedEntry>, StagingError> {
    let content = fs::read_to_string(&raw.payload_path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;

    let type_str = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let (feature_count, dominant_geometry) = match type_str {
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(|v| v.as_array())
                .ok_or_else(|| StagingError::MalformedJson("FeatureCollection missing features array".to_string()))?;
            let kinds: Vec<GeometryKind> = features.iter().filter_map(classify_feature_geometry).collect();
            (Some(features.len() as u64), dominant_kind(&kinds))
        }
        "Feature" => {
            let kinds: Vec<GeometryKind> = classify_feature_geometry(&value).into_iter().collect();
            (Some(1), dominant_kind(&kinds))
        }
        other => {
            return Err(StagingError::MalformedJson(format!(
                "expected FeatureCollection or Feature, found '{other}'"
            )))
        }
    };

    let canonical_name = registry.reserve(authority, &logical_name(raw));
    let stage_dir = stage_dest_dir(staging_root, authority, &raw.source_id)?;
    let staged_path = stage_dir.join(format!("{canonical_name}.geojson"));
    fs::copy(&raw.payload_path, &staged_path)?;

    let entry = StagedEntry {
        source_id: raw.source_id.clone(),
        authority: authority.to_string(),
        canonical_name,
        path: staged_path,
        format: StagedKind::JsonVector,
        crs: raw.declared_crs.clone(),
        feature_count,
        dominant_geometry,
        partial: raw.partial,
    };
    write_meta_sidecar(&entry.path, &entry)?;
    Ok(vec![entry])
}

fn classify_feature_geometry(feature: &serde_json::Value) -> Option<GeometryKind> {
    let geom_type = feature.get("geometry")?.get("type")?.as_str()?;
    Some(match geom_type {
        "Point" | "MultiPoint" => GeometryKind::Point,
        "LineString" | "MultiLineString" => GeometryKind::Line,
        "Polygon" | "MultiPolygon" => GeometryKind::Polygon,
        _ => GeometryKind::Mixed,
    })
}

fn dominant_kind(kinds: &[GeometryKind]) -> Option<GeometryKind> {
    if kinds.is_empty() {
        return None;
    }
    let first = kinds[0];
    if kinds.iter().all(|k| *k == first) {
        Some(first)
    } else {
        Some(GeometryKind::Mixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn raw(format: StagedKind, path: PathBuf) -> RawArtifact {
        RawArtifact::new("nvv_roads", path, format)
    }

    #[test]
    fn name_registry_resolves_collisions() {
        let registry = NameRegistry::new();
        let first = registry.reserve("NVV", "roads");
        let second = registry.reserve("NVV", "roads");
        assert_eq!(first, "nvv_roads");
        assert_eq!(second, "nvv_roads_1");
    }

    #[test]
    fn json_vector_stages_feature_collection_with_dominant_point_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roads.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]}},
                {"type":"Feature","geometry":{"type":"Point","coordinates":[1,1]}}
            ]}"#,
        )
        .unwrap();

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let staged =
            stage_json_vector(&raw(StagedKind::JsonVector, path), "NVV", &registry, staging_root.path())
                .unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].feature_count, Some(2));
        assert_eq!(staged[0].dominant_geometry, Some(GeometryKind::Point));
        assert!(staged[0].path.exists());
        assert!(staged[0].path.with_extension("meta").exists());
    }

    #[test]
    fn json_vector_detects_mixed_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]}},
                {"type":"Feature","geometry":{"type":"Polygon","coordinates":[]}}
            ]}"#,
        )
        .unwrap();

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let staged =
            stage_json_vector(&raw(StagedKind::JsonVector, path), "NVV", &registry, staging_root.path())
                .unwrap();
        assert_eq!(staged[0].dominant_geometry, Some(GeometryKind::Mixed));
    }

    #[test]
    fn json_vector_rejects_malformed_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.geojson");
        fs::write(&path, r#"{"type":"NotAFeature"}"#).unwrap();

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let result =
            stage_json_vector(&raw(StagedKind::JsonVector, path), "NVV", &registry, staging_root.path());
        assert!(matches!(result, Err(StagingError::MalformedJson(_))));
    }

    #[test]
    fn archive_of_split_vector_stages_valid_primary() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("roads.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            zip::write::FileOptions::<()>::default().compression_method(zip::CompressionMethod::Stored);
        for ext in ["shp", "shx", "dbf"] {
            writer.start_file(format!("roads.{ext}"), options).unwrap();
            writer.write_all(b"data").unwrap();
        }
        writer.finish().unwrap();

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let staged = stage_archive_of_split_vector(
            &raw(StagedKind::ArchiveOfSplitVector, zip_path),
            "NVV",
            &registry,
            staging_root.path(),
        )
        .unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].canonical_name, "nvv_roads");
        assert!(staged[0].path.exists());
        assert_eq!(staged[0].path, staging_root.path().join("NVV/nvv_roads/nvv_roads.shp"));
        assert!(staging_root.path().join("NVV/nvv_roads/nvv_roads.shx").exists());
        assert!(staging_root.path().join("NVV/nvv_roads/nvv_roads.dbf").exists());
        assert!(staged[0].path.with_extension("meta").exists());
    }

    #[test]
    fn archive_of_split_vector_fails_without_companions() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("roads.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            zip::write::FileOptions::<()>::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file("roads.shp", options).unwrap();
        writer.write_all(b"data").unwrap();
        writer.finish().unwrap();

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let result = stage_archive_of_split_vector(
            &raw(StagedKind::ArchiveOfSplitVector, zip_path),
            "NVV",
            &registry,
            staging_root.path(),
        );
        assert!(matches!(result, Err(StagingError::NoPrimaryMember)));
    }

    #[test]
    fn container_vector_stages_tables_matching_include() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data.gpkg");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute("CREATE TABLE roads (id INTEGER)", []).unwrap();
        conn.execute("CREATE TABLE rivers (id INTEGER)", []).unwrap();
        conn.execute("INSERT INTO roads VALUES (1), (2)", []).unwrap();
        drop(conn);

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let include = Include(vec!["roads".to_string()]);
        let staged = stage_container_vector(
            &raw(StagedKind::ContainerVector, db_path),
            "NVV",
            &include,
            &registry,
            staging_root.path(),
        )
        .unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].feature_count, Some(2));
        assert_eq!(staged[0].canonical_name, "nvv_roads");
        assert!(staged[0].path.exists());
        assert!(staged[0].path.with_extension("meta").exists());
    }

    #[test]
    fn container_vector_stages_all_tables_when_include_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data.gpkg");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute("CREATE TABLE roads (id INTEGER)", []).unwrap();
        conn.execute("CREATE TABLE rivers (id INTEGER)", []).unwrap();
        drop(conn);

        let staging_root = tempfile::tempdir().unwrap();
        let registry = NameRegistry::new();
        let staged = stage_container_vector(
            &raw(StagedKind::ContainerVector, db_path),
            "NVV",
            &Include::default(),
            &registry,
            staging_root.path(),
        )
        .unwrap();
        assert_eq!(staged.len(), 2);
    }

    #[test]
    fn write_bad_sidecar_creates_summary_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_path = dir.path().join("broken.zip");
        fs::write(&artifact_path, b"not a zip").unwrap();

        write_bad_sidecar(&artifact_path, &StagingError::NoPrimaryMember).unwrap();

        let sidecar = dir.path().join("broken.zip.bad");
        assert!(sidecar.exists());
        let content = fs::read_to_string(sidecar).unwrap();
        assert!(content.contains("staging failed"));
    }
}
