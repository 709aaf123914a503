use std::fs;
use std::path::Path;

use geopipe_retry::{AttemptOutcome, RetryExecutor};
use geopipe_transport::TransportError;
use geopipe_types::{RawArtifact, SourceDescriptor};
use serde_json::Value;

use super::{host_of, HandlerContext, HandlerError, HandlerItemOutcome};

const DEFAULT_PAGE_SIZE: u64 = 1000;

/// Targets a standards-based tiled API (OGC API - Features style): a
/// collections index plus per-collection item streams following `rel=next`
/// hypermedia links. One JSON-vector artifact is emitted per collection.
pub struct TiledCollectionHandler;

impl TiledCollectionHandler {
    pub fn fetch(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        downloads_root: &Path,
    ) -> Result<Vec<HandlerItemOutcome>, HandlerError> {
        let dest_dir = downloads_root.join(&source.authority).join(&source.id);
        fs::create_dir_all(&dest_dir)?;
        let host = host_of(&source.url);

        let target_ids = source.include.as_collection_ids();
        if target_ids.is_empty() {
            return Err(HandlerError::NoTargets);
        }

        let index_url = format!("{}/collections", source.url.trim_end_matches('/'));
        let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
        let index_body = executor
            .run(&host, "tiled_collection", ctx.cancel, |_attempt| {
                fetch_json(ctx, &index_url, &[])
            })
            .map_err(|_| HandlerError::Parse("failed to fetch collections index".to_string()))?;

        let storage_crs_by_id = parse_storage_crs(&index_body);

        let mut outcomes = Vec::with_capacity(target_ids.len());
        for id in target_ids {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            let storage_crs = storage_crs_by_id.get(id).cloned();
            outcomes.push(self.fetch_collection(ctx, source, &dest_dir, id, storage_crs));
        }
        Ok(outcomes)
    }

    fn fetch_collection(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        dest_dir: &Path,
        collection_id: &str,
        storage_crs: Option<String>,
    ) -> HandlerItemOutcome {
        let host = host_of(&source.url);
        let page_size = source.extra_u64("page_size", DEFAULT_PAGE_SIZE);
        let mut url = format!(
            "{}/collections/{collection_id}/items",
            source.url.trim_end_matches('/')
        );
        let mut params = vec![("limit".to_string(), page_size.to_string())];
        if let Some(bbox) = ctx.bbox {
            params.push(("bbox".to_string(), bbox.to_query_string()));
        }

        let mut features: Vec<Value> = Vec::new();
        let mut partial = false;
        let mut first_page = true;
        let mut effective_crs = storage_crs.clone();

        loop {
            if ctx.cancel.is_cancelled() {
                return HandlerItemOutcome::Failed(format!("collection {collection_id}: cancelled"));
            }

            let param_refs: Vec<(&str, &str)> = if first_page {
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
            } else {
                Vec::new()
            };

            let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
            let page = executor.run(&host, "tiled_collection", ctx.cancel, |_attempt| {
                fetch_json(ctx, &url, &param_refs)
            });

            let page = match page {
                Ok(body) => body,
                Err(_) => {
                    partial = true;
                    break;
                }
            };

            let parsed: Value = match serde_json::from_str(&page) {
                Ok(v) => v,
                Err(_) => {
                    partial = true;
                    break;
                }
            };

            let page_features = parsed
                .get("features")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if first_page {
                if let Some(overridden) = crs_override_if_geographic(
                    &source.authority,
                    ctx.crs_override_authorities,
                    storage_crs.as_deref(),
                    &page_features,
                ) {
                    effective_crs = Some(overridden);
                }
            }

            features.extend(page_features);
            first_page = false;

            let next_link = parsed
                .get("links")
                .and_then(Value::as_array)
                .and_then(|links| {
                    links.iter().find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))
                })
                .and_then(|l| l.get("href"))
                .and_then(Value::as_str);

            match next_link {
                Some(href) => {
                    url = resolve_relative(&url, href);
                }
                None => break,
            }
        }

        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": features,
        });

        let path = dest_dir.join(format!("{collection_id}.geojson"));
        match fs::write(&path, collection.to_string()) {
            Ok(()) => {
                let mut artifact = RawArtifact::new(&source.id, path, source.staged_kind)
                    .with_sub_resource(collection_id.to_string());
                if let Some(crs) = effective_crs {
                    artifact = artifact.with_crs(crs);
                }
                artifact.partial = partial;
                HandlerItemOutcome::Produced(artifact)
            }
            Err(e) => HandlerItemOutcome::Failed(format!("collection {collection_id}: {e}")),
        }
    }
}

fn fetch_json(ctx: &HandlerContext, url: &str, params: &[(&str, &str)]) -> AttemptOutcome<String> {
    match ctx.transport.get(url, params) {
        Ok(response) => match response.text() {
            Ok(text) => AttemptOutcome::Success(text),
            Err(_) => AttemptOutcome::Retry { retry_after: None },
        },
        Err(TransportError::Status { status, retry_after })
            if status == 429 || (500..600).contains(&status) =>
        {
            AttemptOutcome::Retry { retry_after }
        }
        Err(TransportError::Cancelled) => AttemptOutcome::Fatal,
        Err(_) => AttemptOutcome::Retry { retry_after: None },
    }
}

fn parse_storage_crs(index_body: &str) -> std::collections::HashMap<String, String> {
    let Ok(value) = serde_json::from_str::<Value>(index_body) else {
        return std::collections::HashMap::new();
    };
    value
        .get("collections")
        .and_then(Value::as_array)
        .map(|collections| {
            collections
                .iter()
                .filter_map(|c| {
                    let id = c.get("id").and_then(Value::as_str)?.to_string();
                    let crs = c.get("storageCrs").and_then(Value::as_str)?.to_string();
                    Some((id, crs))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_relative(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Only trigger the override when the authority is on the configured list
/// AND the first page's coordinate magnitudes fall within geographic bounds
/// despite the advertised CRS looking like a projected system.
fn crs_override_if_geographic(
    authority: &str,
    override_authorities: &[String],
    storage_crs: Option<&str>,
    first_page_features: &[Value],
) -> Option<String> {
    if !override_authorities.iter().any(|a| a == authority) {
        return None;
    }
    if looks_geographic_crs(storage_crs) {
        return None;
    }
    if !all_within_geographic_bounds(first_page_features) {
        return None;
    }
    Some("http://www.opengis.net/def/crs/OGC/1.3/CRS84".to_string())
}

fn looks_geographic_crs(crs: Option<&str>) -> bool {
    match crs {
        None => true,
        Some(uri) => uri.contains("4326") || uri.to_uppercase().contains("CRS84"),
    }
}

fn all_within_geographic_bounds(features: &[Value]) -> bool {
    if features.is_empty() {
        return false;
    }
    features.iter().all(|f| {
        first_coordinate(f)
            .map(|(x, y)| x.abs() <= 180.0 && y.abs() <= 90.0)
            .unwrap_or(false)
    })
}

fn first_coordinate(feature: &Value) -> Option<(f64, f64)> {
    let mut coords = feature.get("geometry")?.get("coordinates")?;
    while let Some(arr) = coords.as_array() {
        match arr.first() {
            Some(next) if next.is_array() => coords = next,
            Some(next) => {
                let x = arr.first()?.as_f64()?;
                let y = arr.get(1)?.as_f64()?;
                let _ = next;
                return Some((x, y));
            }
            None => return None,
        }
    }
    None
}
