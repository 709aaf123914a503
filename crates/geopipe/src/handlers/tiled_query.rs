use std::fs;
use std::path::Path;

use geopipe_retry::{AttemptOutcome, RetryExecutor};
use geopipe_transport::TransportError;
use geopipe_types::{RawArtifact, SourceDescriptor};
use serde_json::Value;

use super::{host_of, HandlerContext, HandlerError, HandlerItemOutcome};

const DEFAULT_MAX_RECORD_COUNT: u64 = 1000;

struct LayerMeta {
    id: i64,
    max_record_count: u64,
}

/// Targets ArcGIS-style endpoints exposing a service metadata document that
/// lists numbered layers with server-advertised record limits. Pages each
/// target layer until the server reports no more records, aggregating every
/// page into one JSON-vector artifact per layer.
pub struct TiledQueryHandler;

impl TiledQueryHandler {
    pub fn fetch(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        downloads_root: &Path,
    ) -> Result<Vec<HandlerItemOutcome>, HandlerError> {
        let dest_dir = downloads_root.join(&source.authority).join(&source.id);
        fs::create_dir_all(&dest_dir)?;
        let host = host_of(&source.url);

        let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
        let metadata_body = executor
            .run(&host, "tiled_query", ctx.cancel, |_attempt| {
                fetch_json(ctx, &source.url, &[("f", "json")])
            })
            .map_err(|_| HandlerError::Parse("failed to fetch service metadata".to_string()))?;

        let layers = parse_layer_inventory(&metadata_body);
        let target_layers = resolve_target_layers(&layers, &source.include.as_layer_ids());
        if target_layers.is_empty() {
            return Err(HandlerError::NoTargets);
        }

        let mut outcomes = Vec::with_capacity(target_layers.len());
        for layer in target_layers {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            outcomes.push(self.fetch_layer(ctx, source, &dest_dir, &layer));
        }
        Ok(outcomes)
    }

    fn fetch_layer(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        dest_dir: &Path,
        layer: &LayerMeta,
    ) -> HandlerItemOutcome {
        let host = host_of(&source.url);
        let query_url = format!("{}/{}/query", source.url.trim_end_matches('/'), layer.id);
        let where_clause = source.extra_str("where_clause", "1=1").to_string();
        let out_fields = source.extra_str("out_fields", "*").to_string();
        let limit = layer.max_record_count;

        let mut features: Vec<Value> = Vec::new();
        let mut partial = false;
        let mut offset: u64 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                partial = true;
                break;
            }

            let mut params = vec![
                ("where".to_string(), where_clause.clone()),
                ("outFields".to_string(), out_fields.clone()),
                ("f".to_string(), "json".to_string()),
                ("resultOffset".to_string(), offset.to_string()),
                ("resultRecordCount".to_string(), limit.to_string()),
            ];
            if let Some(bbox) = ctx.bbox {
                params.push(("geometry".to_string(), bbox.to_query_string()));
                params.push(("geometryType".to_string(), "esriGeometryEnvelope".to_string()));
                params.push(("inSR".to_string(), bbox.crs.clone()));
            }
            let param_refs: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

            let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
            let page = executor.run(&host, "tiled_query", ctx.cancel, |_attempt| {
                fetch_json(ctx, &query_url, &param_refs)
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
            let exceeded = parsed
                .get("exceededTransferLimit")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let page_len = page_features.len() as u64;
            features.extend(page_features);

            if page_len == 0 || (!exceeded && page_len < limit) {
                break;
            }
            offset += limit;
        }

        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": features,
        });

        let path = dest_dir.join(format!("layer_{}.geojson", layer.id));
        match fs::write(&path, collection.to_string()) {
            Ok(()) => {
                let mut artifact = RawArtifact::new(&source.id, path, source.staged_kind)
                    .with_sub_resource(layer.id.to_string());
                artifact.partial = partial;
                HandlerItemOutcome::Produced(artifact)
            }
            Err(e) => HandlerItemOutcome::Failed(format!("layer {}: {e}", layer.id)),
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

fn parse_layer_inventory(body: &str) -> Vec<LayerMeta> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Vec::new();
    };
    value
        .get("layers")
        .and_then(Value::as_array)
        .map(|layers| {
            layers
                .iter()
                .filter_map(|l| {
                    let id = l.get("id").and_then(Value::as_i64)?;
                    let max_record_count = l
                        .get("maxRecordCount")
                        .and_then(Value::as_u64)
                        .unwrap_or(DEFAULT_MAX_RECORD_COUNT);
                    Some(LayerMeta { id, max_record_count })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve which layers to target: the explicit `include` list when present;
/// otherwise every layer; a single-layer service with no explicit include is
/// treated as layer 0 regardless of its advertised id.
fn resolve_target_layers(layers: &[LayerMeta], include_ids: &[i64]) -> Vec<LayerMeta> {
    if !include_ids.is_empty() {
        return layers
            .iter()
            .filter(|l| include_ids.contains(&l.id))
            .map(|l| LayerMeta {
                id: l.id,
                max_record_count: l.max_record_count,
            })
            .collect();
    }

    if layers.len() == 1 {
        return vec![LayerMeta {
            id: 0,
            max_record_count: layers[0].max_record_count,
        }];
    }

    layers
        .iter()
        .map(|l| LayerMeta {
            id: l.id,
            max_record_count: l.max_record_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_layer_inventory_reads_ids_and_record_counts() {
        let body = r#"{"layers":[{"id":0,"name":"roads","maxRecordCount":2000},{"id":1,"name":"rivers"}]}"#;
        let layers = parse_layer_inventory(body);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].id, 0);
        assert_eq!(layers[0].max_record_count, 2000);
        assert_eq!(layers[1].max_record_count, DEFAULT_MAX_RECORD_COUNT);
    }

    #[test]
    fn resolve_target_layers_honors_explicit_include() {
        let layers = vec![
            LayerMeta { id: 0, max_record_count: 1000 },
            LayerMeta { id: 1, max_record_count: 1000 },
        ];
        let resolved = resolve_target_layers(&layers, &[1]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 1);
    }

    #[test]
    fn resolve_target_layers_treats_single_layer_service_as_layer_zero() {
        let layers = vec![LayerMeta { id: 7, max_record_count: 500 }];
        let resolved = resolve_target_layers(&layers, &[]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 0);
    }

    #[test]
    fn resolve_target_layers_targets_all_when_include_empty_and_multiple_layers() {
        let layers = vec![
            LayerMeta { id: 0, max_record_count: 1000 },
            LayerMeta { id: 1, max_record_count: 1000 },
        ];
        let resolved = resolve_target_layers(&layers, &[]);
        assert_eq!(resolved.len(), 2);
    }
}
