use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use geopipe_retry::{AttemptOutcome, RetryExecutor};
use geopipe_transport::TransportError;
use geopipe_types::{RawArtifact, SourceDescriptor, StagedKind};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{host_of, HandlerContext, HandlerError, HandlerItemOutcome};

/// Fetches an Atom/RSS-style feed document, enumerates entries, and
/// downloads each entry's unique enclosure/link URL. When a downloaded
/// archive contains exactly one member matching the source's declared
/// format, the archive is flattened (the member is hoisted out and renamed
/// to the canonicalized source id).
pub struct FeedHandler;

impl FeedHandler {
    pub fn fetch(
        &self,
        ctx: &HandlerContext,
        source: &SourceDescriptor,
        downloads_root: &Path,
    ) -> Result<Vec<HandlerItemOutcome>, HandlerError> {
        let dest_dir = downloads_root.join(&source.authority).join(&source.id);
        let host = host_of(&source.url);

        let executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
        let body = executor.run(&host, "feed", ctx.cancel, |_attempt| {
            match ctx.transport.get(&source.url, &[]) {
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
        });

        let body = body.map_err(|_| HandlerError::Parse("failed to fetch feed document".to_string()))?;

        let urls = dedup_preserve_order(extract_entry_urls(&body));
        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(urls.len());
        for url in urls {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let entry_executor = RetryExecutor::new(ctx.retry_config.clone()).with_breakers(ctx.breakers);
            let result = entry_executor.run(&host, "feed", ctx.cancel, |_attempt| {
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
                    let path = flatten_if_single_container(&path, &source.id, source.staged_kind)
                        .unwrap_or(path);
                    let mut artifact = RawArtifact::new(&source.id, path, source.staged_kind);
                    // A feed entry's download has no server-side query surface to
                    // filter on; note that any configured bbox is deferred to the loader.
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

fn extract_entry_urls(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if local != "link" && local != "enclosure" {
                    continue;
                }
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
                    if key == "href" || key == "url" {
                        if let Ok(value) = attr.unescape_value() {
                            urls.push(value.to_string());
                        }
                    }
                }
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    urls
}

fn dedup_preserve_order(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

/// GeoPackage-style container extension, used to decide whether a
/// downloaded archive should be flattened.
fn container_extension(kind: StagedKind) -> Option<&'static str> {
    match kind {
        StagedKind::ContainerVector => Some("gpkg"),
        _ => None,
    }
}

fn flatten_if_single_container(
    archive_path: &Path,
    source_id: &str,
    kind: StagedKind,
) -> Option<PathBuf> {
    let expected_ext = container_extension(kind)?;
    if archive_path.extension().and_then(|e| e.to_str()) != Some("zip") {
        return None;
    }

    let file = fs::File::open(archive_path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;

    let matches: Vec<usize> = (0..archive.len())
        .filter(|&i| {
            archive
                .by_index(i)
                .ok()
                .map(|f| f.name().to_lowercase().ends_with(&format!(".{expected_ext}")))
                .unwrap_or(false)
        })
        .collect();

    if matches.len() != 1 {
        return None;
    }

    let dest_path = archive_path
        .parent()?
        .join(format!("{source_id}.{expected_ext}"));
    let mut entry = archive.by_index(matches[0]).ok()?;
    let mut out = fs::File::create(&dest_path).ok()?;
    std::io::copy(&mut entry, &mut out).ok()?;
    drop(out);
    drop(entry);
    drop(archive);

    fs::remove_file(archive_path).ok()?;
    Some(dest_path)
}
