//! The HTTP surface: upload per engine, result GET/PUT, artifact links, the
//! static file tree workers fetch inputs from, and the monitor endpoints.

use crate::Frontend;
use anyhow::Result;
use corral_base::{
    EngineConfig, JobId, JobStatus, ERROR_ARTIFACT, INPUT_ARTIFACT, RESULT_ARTIFACT,
};
use hyper::{body::HttpBody as _, header, Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use sha1::{Digest as _, Sha1};
use slog::{error, info};
use std::{path::Path, sync::Arc};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

#[derive(Serialize)]
struct UploadResponse {
    jobid: String,
}

#[derive(Serialize)]
struct ResultResponse {
    status: String,
    summary: String,
    link: String,
}

/// How many bytes of the artifact the result response previews.
const SUMMARY_BYTES: usize = 80;

pub fn internal_error() -> Response<Body> {
    plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn plain_response(status: StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(msg.to_string()))
        .unwrap()
}

fn not_found() -> Response<Body> {
    plain_response(StatusCode::NOT_FOUND, "404 page not found")
}

fn json_response(value: &impl Serialize) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(_) => internal_error(),
    }
}

fn octet_response(body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(body))
        .unwrap()
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    for pair in query?.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

/// Route one request. Every handler answers with a response of its own;
/// nothing in here is allowed to take the server down.
pub async fn serve_request(state: Arc<Frontend>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let query = query.as_deref();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, [engine, "upload"]) => {
            let engine = engine.to_string();
            handle_upload(state, req, &engine, query).await
        }
        (&Method::GET, ["result", jid]) => handle_result_get(&state, jid).await,
        (&Method::PUT, ["result", jid]) => {
            let jid = jid.to_string();
            handle_result_put(state, req, &jid, query).await
        }
        (&Method::GET, ["link", jid]) => handle_link(&state, jid).await,
        (&Method::GET, ["files", rest @ ..]) => handle_files(&state, rest).await,
        (&Method::GET, ["monitor", "queues"]) => handle_queues(&state),
        (&Method::GET, ["monitor", "jobs", "paginate"]) => handle_pagination(&state, query),
        (&Method::GET, ["monitor", "jobs", max_idx, limit, page]) => {
            handle_jobs(&state, query, max_idx, limit, page)
        }
        _ => not_found(),
    }
}

enum UploadError {
    TooLarge,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for UploadError {
    fn from(err: anyhow::Error) -> Self {
        UploadError::Other(err)
    }
}

async fn handle_upload(
    state: Arc<Frontend>,
    req: Request<Body>,
    engine_name: &str,
    query: Option<&str>,
) -> Response<Body> {
    let Some(engine) = state
        .engines
        .iter()
        .find(|engine| engine.name == engine_name)
        .cloned()
    else {
        return not_found();
    };

    let filename = query_param(query, "filename");
    let jid = match state.store.job_create(&engine.name, filename.as_deref()) {
        Ok(jid) => jid,
        Err(err) => {
            error!(state.log, "couldn't create job"; "engine" => &engine.name, "error" => %err);
            return internal_error();
        }
    };

    match do_upload(&state, &engine, jid, req.into_body()).await {
        Ok(response) => {
            if let Err(err) = state.store.job_set_started(jid) {
                error!(state.log, "error setting job to running"; "jid" => %jid, "error" => %err);
            }
            info!(state.log, "job created"; "jid" => %jid, "engine" => &engine.name);
            response
        }
        // An over-limit body only removes the input file; the row keeps its
        // Received status. Everything else that fails here marks the job.
        Err(UploadError::TooLarge) => {
            error!(state.log, "upload over the engine size limit";
                "jid" => %jid, "limit" => engine.size_limit);
            plain_response(StatusCode::BAD_REQUEST, "Request body too long")
        }
        Err(UploadError::Other(err)) => {
            if let Err(err) = state.store.job_set_error(jid, "Error starting job") {
                error!(state.log, "error setting job error"; "jid" => %jid, "error" => %err);
            }
            error!(state.log, "error accepting upload"; "jid" => %jid, "error" => %err);
            internal_error()
        }
    }
}

/// Write the request body to the job's `input` file, hashing as we go, then
/// hand the jid to the broker. The caller decides what each failure does to
/// the job row.
async fn do_upload(
    state: &Frontend,
    engine: &EngineConfig,
    jid: JobId,
    mut body: Body,
) -> Result<Response<Body>, UploadError> {
    state.layout.create_job_dir(jid)?;
    let file = state.layout.create_job_file(jid, INPUT_ARTIFACT)?;
    let mut file = tokio::fs::File::from_std(file);

    let mut hasher = Sha1::new();
    let mut written = 0u64;
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| UploadError::Other(err.into()))?;
        if written + chunk.len() as u64 > engine.size_limit {
            drop(file);
            state.layout.remove_job_file(jid, INPUT_ARTIFACT);
            return Err(UploadError::TooLarge);
        }
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|err| UploadError::Other(err.into()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| UploadError::Other(err.into()))?;
    drop(file);

    let hash = hex::encode(hasher.finalize());
    info!(state.log, "wrote job input"; "jid" => %jid, "bytes" => written, "sha1" => hash);
    // TODO: consult the hash here to dedup identical submissions instead of
    // queueing them again.

    state
        .publisher
        .publish(&engine.name, &jid.to_string())
        .await
        .map_err(UploadError::Other)?;

    Ok(json_response(&UploadResponse {
        jobid: jid.to_string(),
    }))
}

/// Read up to the first [`SUMMARY_BYTES`] bytes of an artifact, or nothing
/// if the file can't be read.
async fn peek(path: &Path) -> String {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return String::new();
    };
    let mut buf = vec![0u8; SUMMARY_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return String::new(),
        }
    }
    String::from_utf8_lossy(&buf[..filled]).into_owned()
}

fn terminal_artifact(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Success => Some(RESULT_ARTIFACT),
        JobStatus::Fail => Some(ERROR_ARTIFACT),
        JobStatus::Received | JobStatus::Running => None,
    }
}

async fn handle_result_get(state: &Frontend, jid_str: &str) -> Response<Body> {
    let Ok(jid) = jid_str.parse::<JobId>() else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid ID");
    };
    let status = match state.store.job_get_status(jid) {
        Ok(status) => status,
        Err(err) => {
            error!(state.log, "error getting job status"; "jid" => %jid, "error" => %err);
            return plain_response(StatusCode::BAD_REQUEST, "Invalid job ID");
        }
    };

    let mut response = ResultResponse {
        status: status.to_string(),
        summary: String::new(),
        link: String::new(),
    };
    if let Some(artifact) = terminal_artifact(status) {
        response.link = format!("/link/{jid}");
        response.summary = peek(&state.layout.job_file_path(jid, artifact)).await;
    }
    json_response(&response)
}

async fn handle_result_put(
    state: Arc<Frontend>,
    req: Request<Body>,
    jid_str: &str,
    query: Option<&str>,
) -> Response<Body> {
    let Ok(jid) = jid_str.parse::<JobId>() else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid ID");
    };
    if let Err(err) = state.store.job_get_status(jid) {
        error!(state.log, "error getting job status"; "jid" => %jid, "error" => %err);
        return plain_response(StatusCode::BAD_REQUEST, "Invalid job ID");
    }

    let artifact = if query_param(query, "status").as_deref() == Some("error") {
        ERROR_ARTIFACT
    } else {
        RESULT_ARTIFACT
    };

    // The exclusive create is what refuses a second PUT against a job that
    // already completed.
    let file = match state.layout.create_job_file(jid, artifact) {
        Ok(file) => file,
        Err(err) => {
            error!(state.log, "error opening result file"; "jid" => %jid, "error" => %err);
            return internal_error();
        }
    };
    let mut file = tokio::fs::File::from_std(file);
    let mut body = req.into_body();
    while let Some(chunk) = body.data().await {
        let write_result = match chunk {
            Ok(chunk) => file.write_all(&chunk).await.map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = write_result {
            error!(state.log, "error writing result file"; "jid" => %jid, "error" => %err);
            return internal_error();
        }
    }
    if let Err(err) = file.flush().await {
        error!(state.log, "error writing result file"; "jid" => %jid, "error" => %err);
        return internal_error();
    }

    let update = if artifact == ERROR_ARTIFACT {
        state.store.job_set_error(jid, "Error")
    } else {
        state.store.job_set_success(jid)
    };
    match update {
        Ok(()) => info!(state.log, "job finished"; "jid" => %jid, "artifact" => artifact),
        Err(err) => {
            error!(state.log, "error marking job finished"; "jid" => %jid, "error" => %err)
        }
    }
    Response::new(Body::empty())
}

async fn handle_link(state: &Frontend, jid_str: &str) -> Response<Body> {
    let Ok(jid) = jid_str.parse::<JobId>() else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid ID");
    };
    let status = match state.store.job_get_status(jid) {
        Ok(status) => status,
        Err(err) => {
            error!(state.log, "error getting job status"; "jid" => %jid, "error" => %err);
            return plain_response(StatusCode::BAD_REQUEST, "Invalid job ID");
        }
    };
    let Some(artifact) = terminal_artifact(status) else {
        return not_found();
    };
    match tokio::fs::read(state.layout.job_file_path(jid, artifact)).await {
        Ok(bytes) => octet_response(bytes),
        Err(_) => not_found(),
    }
}

/// Static files rooted at the job store. This is how workers fetch the
/// `input` artifact.
async fn handle_files(state: &Frontend, rest: &[&str]) -> Response<Body> {
    if rest.is_empty()
        || rest
            .iter()
            .any(|segment| *segment == "." || *segment == ".." || segment.contains('\0'))
    {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid path");
    }
    let mut path = state.layout.root().to_path_buf();
    for segment in rest {
        path.push(segment);
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => octet_response(bytes),
        Err(_) => not_found(),
    }
}

fn handle_queues(state: &Frontend) -> Response<Body> {
    let engine_names: Vec<String> = state
        .engines
        .iter()
        .map(|engine| engine.name.clone())
        .collect();
    match state.store.engine_stats(&engine_names) {
        Ok(stats) => json_response(&serde_json::json!({ "Queues": stats })),
        Err(err) => {
            error!(state.log, "error getting engine stats"; "error" => %err);
            internal_error()
        }
    }
}

fn job_filter(query: Option<&str>) -> crate::store::JobFilter {
    crate::store::JobFilter {
        engine: query_param(query, "eng").filter(|engine| !engine.is_empty()),
        statuses: query_param(query, "st")
            .filter(|statuses| !statuses.is_empty())
            .map(|statuses| statuses.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

fn handle_pagination(state: &Frontend, query: Option<&str>) -> Response<Body> {
    let min_id = match query_param(query, "min-id") {
        None => 0,
        Some(raw) => match raw.parse::<i64>() {
            Ok(min_id) => min_id,
            Err(err) => {
                error!(state.log, "failed to parse min-id"; "value" => raw, "error" => %err);
                return plain_response(StatusCode::BAD_REQUEST, "Invalid Param(s)");
            }
        },
    };
    match state.store.get_pagination(&job_filter(query), min_id) {
        Ok(pagination) => json_response(&pagination),
        Err(err) => {
            error!(state.log, "error getting pagination info"; "error" => %err);
            internal_error()
        }
    }
}

fn handle_jobs(
    state: &Frontend,
    query: Option<&str>,
    max_idx: &str,
    limit: &str,
    page: &str,
) -> Response<Body> {
    let (Ok(max_idx), Ok(limit), Ok(page)) =
        (max_idx.parse::<i64>(), limit.parse::<i64>(), page.parse::<i64>())
    else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid Param(s)");
    };
    match state.store.get_jobs(max_idx, limit, page, &job_filter(query)) {
        Ok(jobs) => json_response(&serde_json::json!({ "jobs": jobs })),
        Err(err) => {
            error!(state.log, "error getting jobs"; "error" => %err);
            internal_error()
        }
    }
}
