//! HTTP surface of the `/video` resource.
//!
//! Handlers are thin: each one performs a single store call (on a blocking
//! thread, SQLite being synchronous) or hands the request to the upload
//! pipeline, then shapes the JSON the frontend expects.

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{Field, MultipartRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use mime_guess::MimeGuess;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{fs::File, task};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::frames::FrameExtractor;
use crate::storage::{MediaStorage, StoredFile};
use crate::store::{VideoPatch, VideoRecord, VideoStore};
use crate::upload::{UploadForm, UploadPipeline};

/// Fields owned by the server; callers may not overwrite them.
const SYSTEM_FIELDS: &[&str] = &[
    "id",
    "url",
    "length_seconds",
    "preview_frames_url",
    "view_count",
];

/// Returned in place of a count when a view could not be recorded.
const VIEW_COUNT_SENTINEL: i64 = -1;

#[derive(Clone)]
pub struct AppState {
    store: Arc<VideoStore>,
    storage: Arc<MediaStorage>,
    pipeline: Arc<UploadPipeline>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        store: VideoStore,
        storage: MediaStorage,
        frames: FrameExtractor,
        max_upload_bytes: usize,
    ) -> Self {
        let store = Arc::new(store);
        let storage = Arc::new(storage);
        let pipeline = UploadPipeline::new(
            Arc::clone(&storage),
            Arc::new(frames),
            Arc::clone(&store),
        );
        Self {
            store,
            storage,
            pipeline: Arc::new(pipeline),
            max_upload_bytes,
        }
    }

    /// Runs `f` against the store on the blocking pool.
    async fn with_store<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&VideoStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
            .map_err(|err| ApiError::internal(format!("{err:#}")))
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/video", get(list_videos).post(upload_video))
        .route(
            "/video/{id}",
            get(get_video).put(update_video).delete(delete_video),
        )
        .route("/video/{id}/viewed", put(mark_viewed))
        .route("/static/{*path}", get(serve_static))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    view_count: Option<i64>,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            view_count: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            view_count: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            view_count: None,
        }
    }

    fn with_view_count(mut self, view_count: i64) -> Self {
        self.view_count = Some(view_count);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }

        let body = if self.status == StatusCode::NOT_FOUND {
            json!({ "msg": self.message })
        } else {
            let mut body = json!({
                "is_success": false,
                "msg": self.message,
            });
            if let Some(count) = self.view_count {
                body["view_count"] = json!(count);
            }
            body
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct UploadResponse {
    is_success: bool,
    video_id: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_success: bool,
}

#[derive(Debug, Serialize)]
struct ViewResponse {
    is_success: bool,
    view_count: i64,
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoRecord>>> {
    let videos = state.with_store(|store| store.list_videos()).await?;
    Ok(Json(videos))
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let mut multipart = multipart.map_err(|rejection| ApiError::internal(rejection.body_text()))?;
    let mut form = UploadForm::default();
    if let Err(err) = read_upload_form(&state.storage, &mut multipart, &mut form).await {
        if let Some(stored) = &form.file {
            state.storage.remove(stored).await;
        }
        return Err(err);
    }

    let record = state
        .pipeline
        .run(form)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(UploadResponse {
        is_success: true,
        video_id: record.id,
    }))
}

/// Collects the form fields and streams the first file part to storage.
/// Additional file parts are skipped.
async fn read_upload_form(
    storage: &MediaStorage,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> ApiResult<()> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::internal(err.body_text()))?
    {
        if let Some(file_name) = field.file_name() {
            if form.file.is_some() {
                warn!(file_name, "ignoring extra file part in upload");
                continue;
            }
            form.file = Some(save_file_part(storage, field).await?);
            continue;
        }

        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|err| ApiError::internal(err.body_text()))?;
        match name.as_str() {
            "name" => form.name = Some(value),
            "description" => form.description = Some(value),
            "tutorial_id" => form.tutorial_id = Some(value),
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    Ok(())
}

/// Writes a file part to disk as its chunks arrive. A part that cannot be
/// read to the end leaves nothing behind.
async fn save_file_part(
    storage: &MediaStorage,
    mut field: Field<'_>,
) -> ApiResult<StoredFile> {
    let original_name = field.file_name().map(str::to_owned);
    let mut pending = storage
        .create(original_name.as_deref())
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                pending.discard().await;
                return Err(ApiError::internal(err.body_text()));
            }
        };
        if let Err(err) = pending.write(&chunk).await {
            pending.discard().await;
            return Err(ApiError::internal(format!("{err:#}")));
        }
    }

    pending
        .finish()
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    let lookup = id.clone();
    let record = state
        .with_store(move |store| store.get_video(&lookup))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("video {id} not found")))?;
    Ok(Json(record))
}

async fn update_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    body: Bytes,
) -> ApiResult<Json<StatusResponse>> {
    let patch = parse_patch(&body).map_err(ApiError::bad_request)?;
    state
        .with_store(move |store| store.update_video(&id, &patch))
        .await?;
    Ok(Json(StatusResponse { is_success: true }))
}

async fn mark_viewed(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ViewResponse>> {
    let lookup = id.clone();
    let view_count = state
        .with_store(move |store| store.increment_view_count(&lookup))
        .await
        .map_err(|err| err.with_view_count(VIEW_COUNT_SENTINEL))?
        .ok_or_else(|| {
            ApiError::internal(format!("video {id} not found")).with_view_count(VIEW_COUNT_SENTINEL)
        })?;
    Ok(Json(ViewResponse {
        is_success: true,
        view_count,
    }))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<StatusResponse>> {
    state
        .with_store(move |store| store.delete_video(&id))
        .await?;
    Ok(Json(StatusResponse { is_success: true }))
}

async fn serve_static(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let path = state
        .storage
        .resolve(&path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(path).await
}

/// Turns an update body into a patch, refusing anything outside the editable
/// fields. An empty body is an empty patch.
fn parse_patch(body: &[u8]) -> Result<VideoPatch, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VideoPatch::default());
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|err| format!("invalid JSON body: {err}"))?;
    let Value::Object(fields) = value else {
        return Err("update body must be a JSON object".to_string());
    };

    let mut patch = VideoPatch::default();
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("name", Value::String(name)) => patch.name = Some(name),
            ("description", Value::String(description)) => {
                patch.description = Some(Some(description))
            }
            ("description", Value::Null) => patch.description = Some(None),
            ("name" | "description", other) => {
                return Err(format!("field `{key}` has an invalid value: {other}"));
            }
            (field, _) if SYSTEM_FIELDS.contains(&field) => {
                return Err(format!("field `{key}` is managed by the server"));
            }
            _ => return Err(format!("unknown field `{key}`")),
        }
    }
    Ok(patch)
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let guessed = MimeGuess::from_path(&path).first();
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}
