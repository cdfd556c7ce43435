//! Transcription endpoints: submit (sync or queued), status poll,
//! abort, and the JSONL result stream.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use verbatim_core::audio::decode_wav;
use verbatim_core::{DecodeConfig, DecodeOutcome, JobRequest, JobStatus, TranscriptResult};

use crate::error::ApiError;
use crate::state::AppState;

/// Query values `1`, `y*`, `t*` count as true.
fn truthy(value: &str) -> bool {
    value == "1" || value.starts_with('y') || value.starts_with('t')
}

fn queue_requested(params: &HashMap<String, String>) -> bool {
    ["enqueue", "queue", "q"]
        .iter()
        .any(|key| params.get(*key).map(|v| truthy(v)).unwrap_or(false))
}

/// `POST /api/whisper` — multipart with a required `input` WAV and an
/// optional `lang`. With a truthy `enqueue|queue|q` query the job is
/// queued and its id returned; otherwise the request decodes
/// synchronously into a full transcript.
pub async fn submit(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut input: Option<Vec<u8>> = None;
    let mut lang = "auto".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "input" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable 'input' field: {e}")))?;
                input = Some(bytes.to_vec());
            }
            "lang" => {
                lang = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable 'lang' field: {e}")))?;
            }
            _ => {}
        }
    }

    let input = input.ok_or_else(|| ApiError::BadRequest("missing 'input' file field".into()))?;

    let pcm = decode_wav(&input).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let mut samples = pcm.samples;

    // Cap the decoded duration when an input limit is configured; the
    // VAD trim range rides on top so a trailing range is not cut mid-
    // speech.
    if state.limits.limit_input_s > 0 {
        let cap = (state.limits.limit_input_s + state.limits.vad_trim_range_s) as usize
            * pcm.sample_rate as usize;
        if samples.len() > cap {
            samples.truncate(cap);
        }
    }

    let config = DecodeConfig {
        lang,
        use_vad: true,
        ..DecodeConfig::default()
    };

    if queue_requested(&params) {
        let request = JobRequest::new(samples, config).with_wav(input);
        let id = state.dispatcher.enqueue(request);
        debug!(job = %id, "transcription job queued");
        return Ok(Json(serde_json::json!({ "id": id })).into_response());
    }

    // Synchronous path: a dedicated decoder on a blocking thread.
    let factory = Arc::clone(&state.factory);
    let (outcome, segments, lang) = tokio::task::spawn_blocking(move || {
        let mut decoder = factory.new_decoder();
        let mut segments = Vec::new();
        let outcome = decoder.transcribe(
            &samples,
            &config,
            &mut |batch| {
                segments.extend(batch);
                true
            },
            &|| false,
        );
        (outcome, segments, decoder.detected_language())
    })
    .await
    .map_err(|e| ApiError::Internal(format!("decode task failed: {e}")))?;

    match outcome {
        DecodeOutcome::Completed => {
            let lang = lang
                .or_else(|| segments.first().map(|s| s.lang.clone()))
                .unwrap_or_default();
            Ok(Json(TranscriptResult { lang, segments }).into_response())
        }
        DecodeOutcome::BadInput => Err(ApiError::BadRequest("no decodable samples".into())),
        DecodeOutcome::ModelError(detail) => Err(ApiError::Internal(detail)),
        DecodeOutcome::Aborted => Err(ApiError::Internal("decode aborted".into())),
    }
}

/// `GET /api/whisper/{id}/status`
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let status = state.dispatcher.status(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(status))
}

/// `GET /api/whisper/{id}/abort` — 200 when a waiting or running job
/// was signalled, 404 for unknown ids, 500 for already-terminal jobs.
pub async fn abort(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let before = state.dispatcher.abort(&id).ok_or(ApiError::NotFound)?;
    match before {
        JobStatus::Waiting | JobStatus::Running => Ok(StatusCode::OK),
        terminal => Err(ApiError::Internal(format!(
            "job already {}",
            terminal.as_str()
        ))),
    }
}

fn terminal_marker(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Done => Some("{\"done\":true}\n"),
        JobStatus::Failed => Some("{\"error\":\"failed\"}\n"),
        JobStatus::Aborted => Some("{\"error\":\"aborted\"}\n"),
        JobStatus::Waiting | JobStatus::Running => None,
    }
}

/// `GET /api/whisper/{id}/wait` — `application/jsonl`: one segment per
/// line as it completes, then a terminal marker. Terminal jobs get the
/// whole body in one response.
pub async fn wait(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.dispatcher.status(&id).ok_or(ApiError::NotFound)?;

    if status.is_terminal() {
        let mut body = String::new();
        if let Some(segments) = state.dispatcher.results(&id) {
            for segment in &segments {
                let line = serde_json::to_string(segment)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                body.push_str(&line);
                body.push('\n');
            }
        }
        if let Some(marker) = terminal_marker(status) {
            body.push_str(marker);
        }
        return Ok(jsonl_response(Body::from(body)));
    }

    // Live job: bridge the blocking waiter into a chunked body. A full
    // channel only slows the waiter down; a closed one means the
    // client went away.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    let dispatcher = Arc::clone(&state.dispatcher);
    let job_id = id.clone();

    tokio::task::spawn_blocking(move || {
        let status = dispatcher.wait(&job_id, |batch, n_new| {
            if n_new == 0 {
                return true;
            }
            for segment in batch {
                let line = match serde_json::to_string(segment) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(job = %job_id, "failed to serialize segment: {e}");
                        continue;
                    }
                };
                if tx.blocking_send(Ok(Bytes::from(line + "\n"))).is_err() {
                    debug!(job = %job_id, "client disconnected, stopping waiter");
                    return false;
                }
            }
            true
        });

        if let Some(marker) = status.and_then(terminal_marker) {
            let _ = tx.blocking_send(Ok(Bytes::from(marker)));
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Ok(jsonl_response(Body::from_stream(stream)))
}

fn jsonl_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/jsonl")],
        body,
    )
        .into_response()
}
