use super::SharedState;
use crate::{
    archive::{self, sink::ChannelSink, ArchiveSummary},
    config::{MAX_THUMBNAIL_SIZE, MIN_THUMBNAIL_SIZE},
    error::{Error, Result},
    listing::{self, Entry},
    mode::{find_entry_document, Mode},
};
use axum::{
    body::Body,
    extract::{FromRequest, Path as AxumPath, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde::Deserialize;
use std::{io, path::Path};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{
    io::ReaderStream,
    sync::{CancellationToken, DropGuard},
};
use tracing::{error, info, warn};

/// Chunks buffered between the archive producer and the socket.
const ARCHIVE_CHANNEL_DEPTH: usize = 8;

#[derive(Deserialize, Debug)]
pub struct PreviewQuery {
    size: Option<u32>,
}

#[derive(Deserialize, Debug)]
pub struct RawQuery {
    download: Option<String>,
}

pub async fn browse_root_handler(State(state): State<SharedState>) -> Result<Json<Vec<Entry>>> {
    browse(&state, "").await
}

pub async fn browse_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Json<Vec<Entry>>> {
    browse(&state, &path).await
}

async fn browse(state: &SharedState, path: &str) -> Result<Json<Vec<Entry>>> {
    let entries = listing::list(&state.root, path, state.list_options()).await?;
    Ok(Json(entries))
}

pub async fn preview_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response> {
    let size = query
        .size
        .unwrap_or(state.thumbnail_size)
        .clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE);
    let thumbnail = state.thumbnails.preview(&state.root, &path, size).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(thumbnail.content_type),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=60"),
    );
    Ok((StatusCode::OK, headers, thumbnail.bytes.clone()).into_response())
}

/// Form-encoded download request: `paths` holds the selection as a JSON array.
/// Lets a plain HTML form stream the archive straight to disk.
#[derive(Deserialize, Debug)]
pub struct DownloadForm {
    paths: String,
}

/// Streams a ZIP of the posted selection.
///
/// The response head is only sent once the producer has pushed its first
/// chunk, so selection errors (escape, missing paths, nothing readable) still
/// turn into a proper error status with an empty body. A failure after that
/// surfaces as a body error so the connection is cut instead of ending
/// cleanly on a truncated archive.
pub async fn download_handler(
    State(state): State<SharedState>,
    request: Request,
) -> Result<Response> {
    let selection = read_selection(request).await?;
    if selection.is_empty() {
        return Err(Error::EmptySelection);
    }
    info!("Download requested for {} paths", selection.len());
    let filename = archive::suggested_name(&state.root, &selection);

    let (mut rx, cancel, job) = spawn_archive(&state, selection);

    let first = match rx.recv().await {
        Some(chunk) => chunk,
        None => {
            return match job.await {
                Ok(Err(e)) => Err(e),
                Ok(Ok(_)) => Err(Error::Io(io::Error::other("archive produced no data"))),
                Err(e) => {
                    error!("Archive task failed: {}", e);
                    Err(Error::Io(io::Error::other(e)))
                }
            };
        }
    };

    let body = archive_body(first, rx, report_outcome(job), cancel.drop_guard());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(archive::CONTENT_TYPE),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition("attachment", &filename),
    );
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Accepts the selection either as a JSON array or as a form with a `paths`
/// field holding that array.
async fn read_selection(request: Request) -> Result<Vec<String>> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let Form(form) = Form::<DownloadForm>::from_request(request, &())
            .await
            .map_err(|e| Error::BadRequest(e.body_text()))?;
        serde_json::from_str(&form.paths)
            .map_err(|e| Error::BadRequest(format!("Invalid paths field: {}", e)))
    } else {
        let Json(selection) = Json::<Vec<String>>::from_request(request, &())
            .await
            .map_err(|e| Error::BadRequest(e.body_text()))?;
        Ok(selection)
    }
}

type ArchiveTask = JoinHandle<Result<ArchiveSummary>>;

/// Starts the archive producer on the blocking pool.
fn spawn_archive(
    state: &SharedState,
    selection: Vec<String>,
) -> (mpsc::Receiver<Bytes>, CancellationToken, ArchiveTask) {
    let (tx, rx) = mpsc::channel::<Bytes>(ARCHIVE_CHANNEL_DEPTH);
    let cancel = CancellationToken::new();
    let job = {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let sink = ChannelSink::new(tx, cancel.clone());
            archive::stream(&state.root, &selection, &state.archive, sink, cancel)
        })
    };
    (rx, cancel, job)
}

/// Logs how the producer ended and hands the outcome to the body stream.
fn report_outcome(job: ArchiveTask) -> oneshot::Receiver<io::Result<()>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = match job.await {
            Ok(Ok(summary)) => {
                info!(
                    "Download finished: {} entries, {} skipped",
                    summary.entries, summary.skipped
                );
                Ok(())
            }
            Ok(Err(Error::Io(e))) => {
                warn!("Download ended early: {}", e);
                Err(e)
            }
            Ok(Err(e)) => {
                warn!("Download ended early: {}", e);
                Err(io::Error::other(e.to_string()))
            }
            Err(e) => {
                error!("Archive task failed: {}", e);
                Err(io::Error::other(e))
            }
        };
        // The body may already be gone.
        let _ = tx.send(outcome);
    });
    rx
}

/// Response body fed by the producer. Dropping it (client gone) cancels the
/// producer through `guard`; a failed producer ends it with an error.
fn archive_body(
    first: Bytes,
    rx: mpsc::Receiver<Bytes>,
    outcome: oneshot::Receiver<io::Result<()>>,
    guard: DropGuard,
) -> Body {
    let rest = stream::unfold(Some((rx, outcome, guard)), |state| async move {
        let (mut rx, outcome, guard) = state?;
        match rx.recv().await {
            Some(chunk) => Some((Ok(chunk), Some((rx, outcome, guard)))),
            None => match outcome.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((Err(e), None)),
                Err(_) => Some((Err(io::Error::other("archive task vanished")), None)),
            },
        }
    });
    Body::from_stream(stream::once(async move { Ok::<_, io::Error>(first) }).chain(rest))
}

pub async fn raw_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<RawQuery>,
) -> Result<Response> {
    let full_path = state.root.resolve(&path).await?;
    if !is_file(&full_path).await {
        return Err(Error::NotFound(path));
    }
    let disposition = match query.download.as_deref() {
        None | Some("0") | Some("false") => "inline",
        Some(_) => "attachment",
    };
    serve_file(&full_path, &path, disposition).await
}

pub async fn webapp_index_handler(State(state): State<SharedState>) -> Result<Response> {
    let Mode::WebApp { entry } = &state.mode else {
        return Err(Error::NotFound(String::new()));
    };
    let full_path = state.root.resolve(entry).await?;
    serve_file(&full_path, entry, "inline").await
}

/// Static assets under the root. Directories serve their own entry document.
pub async fn webapp_asset_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response> {
    let mut full_path = state.root.resolve(&path).await?;
    let is_dir = tokio::fs::metadata(&full_path)
        .await
        .map(|m| m.is_dir())
        .map_err(|e| Error::from_io(e, &path))?;
    if is_dir {
        let dir = full_path.clone();
        let entry = tokio::task::spawn_blocking(move || find_entry_document(&dir))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        full_path = state.root.resolve(&format!("{}/{}", path, entry)).await?;
    }
    if !is_file(&full_path).await {
        return Err(Error::NotFound(path));
    }
    serve_file(&full_path, &path, "inline").await
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Streams a file with its guessed content type and length.
async fn serve_file(full_path: &Path, relative: &str, disposition: &str) -> Result<Response> {
    let metadata = tokio::fs::metadata(full_path).await.map_err(|e| {
        error!("Failed to get metadata for file {}: {}", full_path.display(), e);
        Error::from_io(e, relative)
    })?;
    let file = tokio::fs::File::open(full_path).await.map_err(|e| {
        error!("Failed to open file {}: {}", full_path.display(), e);
        Error::from_io(e, relative)
    })?;

    let filename = full_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");
    let mime_type = mime_guess::from_path(full_path)
        .first_or_octet_stream()
        .to_string();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(disposition, filename),
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// `Content-Disposition` with an ASCII fallback name plus the RFC 5987
/// encoded original.
fn content_disposition(disposition: &str, filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        disposition,
        fallback,
        urlencoding::encode(filename)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServeConfig, resolve::Root, server::AppState};
    use http_body_util::BodyExt;
    use std::{fs, sync::Arc};

    #[test]
    fn test_content_disposition_encodes_names() {
        let value = content_disposition("attachment", "fotos \"ñ\".zip");
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"fotos ___.zip\"; filename*=UTF-8''fotos%20%22%C3%B1%22.zip"
        );
    }

    #[tokio::test]
    async fn test_archive_body_passes_chunks_through() {
        let (tx, rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tx.send(Bytes::from_static(b" world")).await.unwrap();
        drop(tx);
        outcome_tx.send(Ok(())).unwrap();

        let body = archive_body(
            Bytes::from_static(b"hello"),
            rx,
            outcome_rx,
            CancellationToken::new().drop_guard(),
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn test_archive_body_errors_when_producer_fails_midway() {
        let (tx, rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tx.send(Bytes::from_static(b"more")).await.unwrap();
        drop(tx);
        outcome_tx
            .send(Err(io::Error::new(io::ErrorKind::TimedOut, "reading the file stalled")))
            .unwrap();

        let mut body = archive_body(
            Bytes::from_static(b"PK"),
            rx,
            outcome_rx,
            CancellationToken::new().drop_guard(),
        );
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], b"PK");
        let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&second[..], b"more");
        assert!(body.frame().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dropping_download_body_stops_producer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut state = 0x9e37_79b9_u32;
        let noise: Vec<u8> = (0..8 * 1024 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        fs::write(temp_dir.path().join("big.bin"), &noise).unwrap();
        let root = Root::new(temp_dir.path()).unwrap();
        let state: SharedState = Arc::new(AppState::new(ServeConfig::new(root, Mode::FileManager)));

        let (mut rx, cancel, job) = spawn_archive(&state, vec!["big.bin".to_string()]);
        let first = rx.recv().await.unwrap();
        let (_outcome_tx, outcome_rx) = oneshot::channel();
        let mut body = archive_body(first, rx, outcome_rx, cancel.clone().drop_guard());
        body.frame().await.unwrap().unwrap();
        drop(body);

        let result = job.await.unwrap();
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(cancel.is_cancelled());
    }
}
