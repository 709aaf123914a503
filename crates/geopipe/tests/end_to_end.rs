//! Integration coverage for the six concrete end-to-end scenarios: one
//! extract handler exercised against a real (in-process) HTTP server per
//! test, through to a staged entry or a terminal source outcome.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tiny_http::{Response, Server};

use geopipe::handlers::{DirectFileHandler, FeedHandler, HandlerContext, HandlerItemOutcome};
use geopipe::handlers::{TiledCollectionHandler, TiledQueryHandler};
use geopipe_retry::{CircuitBreakerTable, RetryPolicy, RetryStrategyConfig};
use geopipe_transport::HttpTransport;
use geopipe_types::{CancellationToken, Include, SourceDescriptor, SourceKind, StagedKind};

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5), 4, "geopipe-test/0")
}

fn fast_retry_config(max_attempts: u32) -> RetryStrategyConfig {
    RetryStrategyConfig {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..RetryPolicy::Default.to_config()
    }
}

fn source(kind: SourceKind, url: String, staged_kind: StagedKind, include: Include) -> SourceDescriptor {
    SourceDescriptor {
        id: "nvv_src".to_string(),
        name: "src".to_string(),
        authority: "NVV".to_string(),
        kind,
        url,
        enabled: true,
        staged_kind,
        include,
        bbox: None,
        extra: serde_json::Map::new(),
    }
}

fn zip_with_companions(stem: &str) -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::<u8>::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let opts = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for ext in ["shp", "shx", "dbf"] {
        writer.start_file(format!("{stem}.{ext}"), opts).unwrap();
        writer.write_all(b"dummy").unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// Scenario 1: DirectFile zip -> staging extracts the 3 companion members.
#[test]
fn direct_file_zip_stages_split_vector_companions() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());
    let handle = std::thread::spawn(move || {
        let req = server.recv().unwrap();
        let body = zip_with_companions("x");
        req.respond(Response::from_data(body)).unwrap();
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let cancel = CancellationToken::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &[],
    };

    let src = source(
        SourceKind::DirectFile,
        format!("{addr}/a.zip"),
        StagedKind::ArchiveOfSplitVector,
        Include::default(),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let outcomes = DirectFileHandler.fetch(&ctx, &src, downloads_root.path()).unwrap();
    assert_eq!(outcomes.len(), 1);
    let HandlerItemOutcome::Produced(artifact) = &outcomes[0] else {
        panic!("expected a produced artifact");
    };

    let staging_root = tempfile::tempdir().unwrap();
    let registry = geopipe_staging::NameRegistry::new();
    let staged = geopipe_staging::stage_artifact(
        artifact,
        &src.authority,
        &src.include,
        &registry,
        staging_root.path(),
    )
    .unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].canonical_name, "nvv_x");
    assert!(staged[0].path.exists());
    let dir = staged[0].path.parent().unwrap();
    assert!(dir.join("x.shp").exists());
    assert!(dir.join("x.shx").exists());
    assert!(dir.join("x.dbf").exists());

    handle.join().unwrap();
}

// Scenario 2: a feed listing the same URL twice is deduplicated before
// download; only the unique URLs are fetched and staged.
#[test]
fn feed_handler_dedups_repeated_entry_urls() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());
    let hits_u1 = Arc::new(AtomicUsize::new(0));
    let hits_u1_clone = Arc::clone(&hits_u1);
    let addr_for_feed = addr.clone();

    let handle = std::thread::spawn(move || {
        // 1 feed fetch + 2 unique downloads (u1, u2) = 3 requests.
        for _ in 0..3 {
            let req = server.recv().unwrap();
            let url = req.url().to_string();
            if url.starts_with("/feed") {
                let body = format!(
                    r#"<feed>
                        <entry><link href="{addr_for_feed}/u1"/></entry>
                        <entry><link href="{addr_for_feed}/u1"/></entry>
                        <entry><link href="{addr_for_feed}/u2"/></entry>
                    </feed>"#
                );
                req.respond(Response::from_string(body)).unwrap();
            } else if url.starts_with("/u1") {
                hits_u1_clone.fetch_add(1, Ordering::SeqCst);
                req.respond(Response::from_data(b"one".to_vec())).unwrap();
            } else {
                req.respond(Response::from_data(b"two".to_vec())).unwrap();
            }
        }
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let cancel = CancellationToken::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &[],
    };

    let src = source(
        SourceKind::Feed,
        format!("{addr}/feed"),
        StagedKind::ArchiveOfSplitVector,
        Include::default(),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let outcomes = FeedHandler.fetch(&ctx, &src, downloads_root.path()).unwrap();
    assert_eq!(outcomes.len(), 2, "exactly two unique URLs should produce two artifacts");
    assert!(outcomes.iter().all(|o| matches!(o, HandlerItemOutcome::Produced(_))));
    assert_eq!(hits_u1.load(Ordering::SeqCst), 1, "the duplicate u1 entry must not be re-downloaded");

    handle.join().unwrap();
}

// Scenario 3: TiledQuery aggregates pages (1000, 1000, 427) into one
// 2427-feature artifact, and a zero-feature layer still yields a
// well-formed empty FeatureCollection.
#[test]
fn tiled_query_aggregates_pages_and_emits_empty_layer() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());

    let handle = std::thread::spawn(move || {
        // metadata + 3 pages for layer 0 + 1 page for layer 1 = 5 requests.
        for _ in 0..5 {
            let req = server.recv().unwrap();
            let url = req.url().to_string();
            let body = if url.starts_with("/service?") || url == "/service" {
                r#"{"layers":[{"id":0,"maxRecordCount":1000},{"id":1,"maxRecordCount":1000}]}"#.to_string()
            } else if url.contains("/0/query") {
                let offset: u64 = url
                    .split("resultOffset=")
                    .nth(1)
                    .and_then(|s| s.split('&').next())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let (count, exceeded) = match offset {
                    0 => (1000, true),
                    1000 => (1000, true),
                    _ => (427, false),
                };
                let features: Vec<_> = (0..count)
                    .map(|_| serde_json::json!({"type":"Feature","geometry":null}))
                    .collect();
                serde_json::json!({"features": features, "exceededTransferLimit": exceeded}).to_string()
            } else {
                serde_json::json!({"features": [], "exceededTransferLimit": false}).to_string()
            };
            req.respond(Response::from_string(body)).unwrap();
        }
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let cancel = CancellationToken::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &[],
    };

    let src = source(
        SourceKind::TiledQuery,
        format!("{addr}/service"),
        StagedKind::JsonVector,
        Include::default(),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let outcomes = TiledQueryHandler.fetch(&ctx, &src, downloads_root.path()).unwrap();
    assert_eq!(outcomes.len(), 2);

    let read_features = |outcome: &HandlerItemOutcome| -> usize {
        let HandlerItemOutcome::Produced(artifact) = outcome else {
            panic!("expected produced artifact");
        };
        let body = std::fs::read_to_string(&artifact.payload_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["type"], "FeatureCollection");
        parsed["features"].as_array().unwrap().len()
    };

    let counts: Vec<usize> = outcomes.iter().map(read_features).collect();
    assert!(counts.contains(&2427), "layer 0 should aggregate to 2427 features, got {counts:?}");
    assert!(counts.contains(&0), "layer 1 should be an empty but well-formed collection");

    handle.join().unwrap();
}

// Scenario 4: TiledCollection overrides a projected CRS to geographic when
// the authority is on the allow-list and first-page coordinates fall
// within |x|<=180, |y|<=90.
#[test]
fn tiled_collection_overrides_crs_for_listed_authority_and_geographic_magnitudes() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());

    let handle = std::thread::spawn(move || {
        // collections index + one items page = 2 requests.
        for _ in 0..2 {
            let req = server.recv().unwrap();
            let url = req.url().to_string();
            let body = if url.ends_with("/collections") {
                r#"{"collections":[{"id":"roads","storageCrs":"EPSG:3006"}]}"#.to_string()
            } else {
                serde_json::json!({
                    "features": [
                        {"type":"Feature","geometry":{"type":"Point","coordinates":[18.0,59.3]}}
                    ],
                    "links": []
                })
                .to_string()
            };
            req.respond(Response::from_string(body)).unwrap();
        }
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let cancel = CancellationToken::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &["NVV".to_string()],
    };

    let src = source(
        SourceKind::TiledCollection,
        addr,
        StagedKind::JsonVector,
        Include(vec!["roads".to_string()]),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let outcomes = TiledCollectionHandler.fetch(&ctx, &src, downloads_root.path()).unwrap();
    assert_eq!(outcomes.len(), 1);
    let HandlerItemOutcome::Produced(artifact) = &outcomes[0] else {
        panic!("expected a produced artifact");
    };
    assert_eq!(
        artifact.declared_crs.as_deref(),
        Some("http://www.opengis.net/def/crs/OGC/1.3/CRS84")
    );

    handle.join().unwrap();
}

// Scenario 5: a service that always fails (503) is retried up to
// `max_attempts` and no further; the handler reports a whole-source
// failure rather than retrying forever.
#[test]
fn retry_exhausts_configured_attempts_then_fails() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = Arc::clone(&attempts);

    let handle = std::thread::spawn(move || loop {
        match server.recv_timeout(Duration::from_secs(2)) {
            Ok(Some(req)) => {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                req.respond(Response::empty(tiny_http::StatusCode(503))).unwrap();
            }
            _ => break,
        }
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let cancel = CancellationToken::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &[],
    };

    let src = source(
        SourceKind::TiledQuery,
        format!("{addr}/service"),
        StagedKind::JsonVector,
        Include::default(),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let result = TiledQueryHandler.fetch(&ctx, &src, downloads_root.path());
    assert!(result.is_err(), "service metadata never succeeds, the whole source must fail");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "exactly max_attempts requests should be made");

    drop(ctx);
    handle.join().unwrap();
}

// Scenario 6: cancellation mid-pagination finalizes a partial artifact with
// the features collected so far rather than discarding them.
#[test]
fn cancellation_mid_pagination_finalizes_partial_artifact() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", server.server_addr());
    let cancel = CancellationToken::new();
    let cancel_from_server = cancel.clone();
    let served = Arc::new(AtomicUsize::new(0));
    let served_clone = Arc::clone(&served);

    let handle = std::thread::spawn(move || loop {
        match server.recv_timeout(Duration::from_secs(2)) {
            Ok(Some(req)) => {
                let url = req.url().to_string();
                let body = if url.contains("/0/query") {
                    let n = served_clone.fetch_add(1, Ordering::SeqCst);
                    if n >= 2 {
                        cancel_from_server.cancel();
                    }
                    let features: Vec<_> = (0..100)
                        .map(|_| serde_json::json!({"type":"Feature","geometry":null}))
                        .collect();
                    serde_json::json!({"features": features, "exceededTransferLimit": true}).to_string()
                } else {
                    r#"{"layers":[{"id":0,"maxRecordCount":100}]}"#.to_string()
                };
                req.respond(Response::from_string(body)).unwrap();
            }
            _ => break,
        }
    });

    let transport = transport();
    let breakers = CircuitBreakerTable::new();
    let ctx = HandlerContext {
        transport: &transport,
        retry_config: fast_retry_config(3),
        breakers: &breakers,
        cancel: &cancel,
        bbox: None,
        crs_override_authorities: &[],
    };

    let src = source(
        SourceKind::TiledQuery,
        format!("{addr}/service"),
        StagedKind::JsonVector,
        Include::default(),
    );
    let downloads_root = tempfile::tempdir().unwrap();

    let outcomes = TiledQueryHandler.fetch(&ctx, &src, downloads_root.path()).unwrap();
    assert_eq!(outcomes.len(), 1);
    let HandlerItemOutcome::Produced(artifact) = &outcomes[0] else {
        panic!("a cancelled mid-pagination layer should still finalize a partial artifact");
    };
    assert!(artifact.partial, "the artifact must be marked partial");

    let body = std::fs::read_to_string(&artifact.payload_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    let count = parsed["features"].as_array().unwrap().len();
    assert!(count > 0 && count % 100 == 0, "should retain whole pages collected before cancellation, got {count}");

    handle.join().unwrap();
}
