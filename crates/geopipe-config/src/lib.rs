//! Configuration document loading for the geopipe ingestion engine.
//!
//! Three independent TOML documents are parsed: global settings, the
//! per-source inventory, and optional name-mapping overrides. A malformed
//! document is a hard error (the run aborts with exit code 1); a single bad
//! *record* inside an otherwise-valid inventory is rejected and excluded,
//! with the reason captured in a [`ConfigLoadReport`] rather than aborting
//! the whole load.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use geopipe_types::{
    BBox, ConfigLoadReport, Include, NameMapping, RejectedRecord, SourceDescriptor, SourceKind,
    StagedKind,
};
use serde_json::Value as JsonValue;

/// Load and validate the global settings document.
pub fn load_global_settings(path: &Path) -> Result<geopipe_types::GlobalSettings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read global settings at {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse global settings at {}", path.display()))
}

/// Load the optional name-mapping overrides document. A missing file is not
/// an error: it simply means no mappings apply.
pub fn load_name_mappings(path: &Path) -> Result<Vec<NameMapping>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read name mappings at {}", path.display()))?;

    #[derive(serde::Deserialize)]
    struct Document {
        #[serde(default)]
        mappings: Vec<NameMapping>,
    }

    let doc: Document = toml::from_str(&content)
        .with_context(|| format!("failed to parse name mappings at {}", path.display()))?;
    Ok(doc.mappings)
}

/// Load the source inventory. Parse failure of the whole document is fatal;
/// per-record validation failures are collected in the returned report
/// rather than aborting.
pub fn load_inventory(path: &Path) -> Result<ConfigLoadReport> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read source inventory at {}", path.display()))?;

    let raw: toml::Value = content
        .parse()
        .with_context(|| format!("failed to parse source inventory at {}", path.display()))?;
    let as_json: JsonValue =
        serde_json::to_value(&raw).context("failed to convert inventory TOML to JSON")?;

    let records = as_json
        .get("sources")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    let mut parsed = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for (raw_index, record) in records.into_iter().enumerate() {
        match parse_source_record(record) {
            Ok(source) => parsed.push((raw_index, source)),
            Err((name_if_known, reason)) => rejected.push(RejectedRecord {
                raw_index,
                name_if_known,
                reason,
            }),
        }
    }

    let mut seen_ids = std::collections::HashSet::new();
    let mut accepted = Vec::with_capacity(parsed.len());
    for (raw_index, source) in parsed {
        if seen_ids.insert(source.id.clone()) {
            accepted.push(source);
        } else {
            rejected.push(RejectedRecord {
                raw_index,
                name_if_known: Some(source.name.clone()),
                reason: format!("duplicate source id '{}'", source.id),
            });
        }
    }

    Ok(ConfigLoadReport { accepted, rejected })
}

/// Parse one inventory record. Returns `Err((name_if_known, reason))` on any
/// validation failure so the caller can build a [`RejectedRecord`].
fn parse_source_record(mut record: JsonValue) -> Result<SourceDescriptor, (Option<String>, String)> {
    let obj = record
        .as_object_mut()
        .ok_or_else(|| (None, "source record is not a table".to_string()))?;

    let name = take_string(obj, "name").ok_or_else(|| (None, "missing required field: name".to_string()))?;
    let authority = take_string(obj, "authority")
        .ok_or_else(|| (Some(name.clone()), "missing required field: authority".to_string()))?;
    let type_raw = take_string(obj, "type")
        .ok_or_else(|| (Some(name.clone()), "missing required field: type".to_string()))?;
    let url = take_string(obj, "url")
        .ok_or_else(|| (Some(name.clone()), "missing required field: url".to_string()))?;

    let kind: SourceKind = serde_json::from_value(JsonValue::String(type_raw.clone()))
        .map_err(|_| (Some(name.clone()), format!("unrecognized source type: {type_raw}")))?;

    let enabled = obj
        .remove("enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let staged_kind = match obj.remove("staged_data_type") {
        Some(v) => serde_json::from_value(v)
            .map_err(|_| (Some(name.clone()), "unrecognized staged_data_type".to_string()))?,
        None => default_staged_kind_for(kind),
    };

    let include = obj
        .remove("include")
        .map(|v| {
            v.as_array()
                .map(|items| {
                    Include(
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect(),
                    )
                })
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let bbox = obj
        .remove("bbox")
        .and_then(|v| serde_json::from_value::<[f64; 4]>(v).ok())
        .map(|[xmin, ymin, xmax, ymax]| BBox::new(xmin, ymin, xmax, ymax, BBox::WGS84));

    if let Some(bbox) = &bbox {
        if !bbox.is_well_formed() {
            return Err((Some(name), "bbox is not well-formed (min > max on some axis)".to_string()));
        }
    }

    // Flatten a nested `raw` table (if present) into the top level, then
    // collect whatever top-level keys remain as the opaque `extra` bag.
    if let Some(JsonValue::Object(raw_table)) = obj.remove("raw") {
        for (k, v) in raw_table {
            obj.entry(k).or_insert(v);
        }
    }
    obj.remove("download_format");

    let extra: serde_json::Map<String, JsonValue> = obj.clone();

    let id = geopipe_naming::sanitize_identifier(&format!("{authority}_{name}"));

    Ok(SourceDescriptor {
        id,
        name,
        authority,
        kind,
        url,
        enabled,
        staged_kind,
        include,
        bbox,
        extra,
    })
}

fn default_staged_kind_for(kind: SourceKind) -> StagedKind {
    match kind {
        SourceKind::TiledQuery | SourceKind::TiledCollection => StagedKind::JsonVector,
        SourceKind::DirectFile | SourceKind::Feed => StagedKind::ArchiveOfSplitVector,
    }
}

fn take_string(obj: &mut serde_json::Map<String, JsonValue>, key: &str) -> Option<String> {
    obj.remove(key).and_then(|v| match v {
        JsonValue::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn global_settings_parses_with_defaults() {
        let f = write_temp("use_bbox_filter = true\n");
        let settings = load_global_settings(f.path()).unwrap();
        assert!(settings.use_bbox_filter);
        assert_eq!(settings.processing.per_host_concurrency, 4);
    }

    #[test]
    fn inventory_accepts_well_formed_source() {
        let f = write_temp(
            r#"
            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "file"
            url = "http://example.com/roads.zip"
            "#,
        );
        let report = load_inventory(f.path()).unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert!(report.rejected.is_empty());
        assert_eq!(report.accepted[0].kind, SourceKind::DirectFile);
        assert_eq!(report.accepted[0].id, "nvv_roads");
    }

    #[test]
    fn inventory_rejects_missing_required_field_without_aborting() {
        let f = write_temp(
            r#"
            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "file"
            url = "http://example.com/roads.zip"

            [[sources]]
            name = "broken"
            authority = "NVV"
            type = "file"
            "#,
        );
        let report = load_inventory(f.path()).unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].name_if_known, Some("broken".to_string()));
    }

    #[test]
    fn inventory_rejects_duplicate_source_id_instead_of_dropping_silently() {
        let f = write_temp(
            r#"
            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "file"
            url = "http://example.com/roads.zip"

            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "file"
            url = "http://example.com/roads-2.zip"
            "#,
        );
        let report = load_inventory(f.path()).unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].raw_index, 1);
        assert!(report.rejected[0].reason.contains("duplicate source id"));
    }

    #[test]
    fn inventory_normalizes_geojson_and_json_aliases() {
        let f = write_temp(
            r#"
            [[sources]]
            name = "a"
            authority = "X"
            type = "ogc_api"
            url = "http://example.com/a"
            staged_data_type = "geojson"

            [[sources]]
            name = "b"
            authority = "X"
            type = "ogc_api"
            url = "http://example.com/b"
            staged_data_type = "json"
            "#,
        );
        let report = load_inventory(f.path()).unwrap();
        assert_eq!(report.accepted[0].staged_kind, report.accepted[1].staged_kind);
    }

    #[test]
    fn inventory_preserves_unknown_keys_in_extra() {
        let f = write_temp(
            r#"
            [[sources]]
            name = "roads"
            authority = "NVV"
            type = "rest_api"
            url = "http://example.com/svc"
            page_size = 500
            where_clause = "STATUS='A'"
            "#,
        );
        let report = load_inventory(f.path()).unwrap();
        let extra = &report.accepted[0].extra;
        assert_eq!(extra.get("page_size").and_then(|v| v.as_u64()), Some(500));
        assert_eq!(
            extra.get("where_clause").and_then(|v| v.as_str()),
            Some("STATUS='A'")
        );
    }

    #[test]
    fn name_mappings_missing_file_yields_empty() {
        let mappings = load_name_mappings(Path::new("/nonexistent/name_mappings.toml")).unwrap();
        assert!(mappings.is_empty());
    }
}
