use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::db::{DEFAULT_PASSWORD_COST, Db};
use crate::error::{ClinicError, ErrorResponse};
use crate::storage::{Uploads, sanitize_filename};
use crate::translate::{Translator, TranslatorConfig};
use crate::types::{
    CreateDoctorParams, CreatePatientParams, CreateSleepRecordParams, FileAttachment,
    FileCategory, NewAttachment, PasswordCheck, PasswordVerdict, UpdateDoctorFields,
    UpdatePatientFields, UpdateSleepRecordFields, UploadBatch,
};

pub const DEFAULT_PORT: u16 = 7640;
/// Most files one multipart upload may carry (a full CT series).
pub const MAX_FILES_PER_UPLOAD: usize = 550;
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Characters left bare in an RFC 5987 `filename*` value.
const FILENAME_ATTR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub translator: Option<TranslatorConfig>,
    pub password_cost: u32,
}

impl DaemonConfig {
    pub fn new(port: u16, data_dir: PathBuf) -> Self {
        DaemonConfig {
            port,
            data_dir,
            translator: None,
            password_cost: DEFAULT_PASSWORD_COST,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Db>>,
    uploads: Uploads,
    translator: Option<Translator>,
}

impl AppState {
    pub fn open(config: &DaemonConfig) -> Result<AppState, ClinicError> {
        let mut db = Db::open(&config.data_dir)?;
        db.password_cost = config.password_cost;
        let uploads = Uploads::open(&config.data_dir)?;
        let translator = config.translator.clone().map(Translator::new).transpose()?;
        if translator.is_none() {
            tracing::warn!("no translation API key configured; /translate is disabled");
        }
        Ok(AppState {
            db: Arc::new(Mutex::new(db)),
            uploads,
            translator,
        })
    }

    fn db(&self) -> Result<MutexGuard<'_, Db>, AppError> {
        self.db
            .lock()
            .map_err(|_| AppError(ClinicError::Internal("database lock poisoned".to_string())))
    }
}

struct AppError(ClinicError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClinicError::NotFound(_) => StatusCode::NOT_FOUND,
            ClinicError::InvalidId(_) | ClinicError::Validation(_) => StatusCode::BAD_REQUEST,
            ClinicError::Conflict(_) | ClinicError::AlreadyLinked { .. } => StatusCode::CONFLICT,
            ClinicError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ClinicError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ClinicError::Internal(msg) => {
                tracing::error!("{msg}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse::from(&self.0);
        (status, Json(body)).into_response()
    }
}

impl From<ClinicError> for AppError {
    fn from(err: ClinicError) -> Self {
        AppError(err)
    }
}

fn json<T: Serialize>(value: T) -> Json<T> {
    Json(value)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/status", get(status))
        .route("/patients", get(list_patients).post(create_patient))
        .route(
            "/patients/{id}",
            get(get_patient).patch(update_patient).delete(delete_patient),
        )
        .route("/patients/{id}/verify-password", post(verify_patient_password))
        .route("/doctors", get(list_doctors).post(create_doctor))
        .route(
            "/doctors/{id}",
            get(get_doctor).patch(update_doctor).delete(delete_doctor),
        )
        .route("/doctors/{id}/patients", post(link_patients))
        .route("/doctors/{id}/patients/{patient_id}", delete(unlink_patient))
        .route("/sleep", get(list_sleep_records).post(create_sleep_record))
        .route(
            "/sleep/{id}",
            get(get_sleep_record)
                .patch(update_sleep_record)
                .delete(delete_sleep_record),
        )
        .route(
            "/sleep/{id}/files",
            get(list_files)
                .post(upload_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/files/{id}", get(download_file))
        .route("/translate", post(translate))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(cors)
        .with_state(state)
}

pub async fn start(config: DaemonConfig) -> Result<(), ClinicError> {
    let state = AppState::open(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| ClinicError::Internal(format!("failed to bind port {}: {e}", config.port)))?;

    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        "somno daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ClinicError::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl+c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.status()?))
}

// --- Patient endpoints ---

async fn create_patient(
    State(state): State<AppState>,
    Json(body): Json<CreatePatientParams>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    let patient = db.create_patient(&body)?;
    Ok((StatusCode::CREATED, json(patient)))
}

async fn list_patients(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.list_patients()?))
}

async fn get_patient(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.get_patient(&id)?))
}

async fn update_patient(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePatientFields>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.update_patient(&id, &body)?))
}

async fn delete_patient(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let db = state.db()?;
    db.delete_patient(&id)?;
    if let Err(e) = state.uploads.remove_patient(&id) {
        tracing::warn!(patient_id = %id, "patient deleted but its uploads remain: {e}");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn verify_patient_password(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PasswordCheck>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    let is_valid = db.verify_patient_password(&id, &body.password)?;
    Ok(json(PasswordVerdict { is_valid }))
}

// --- Doctor endpoints ---

async fn create_doctor(
    State(state): State<AppState>,
    Json(body): Json<CreateDoctorParams>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    let doctor = db.create_doctor(&body)?;
    Ok((StatusCode::CREATED, json(doctor)))
}

async fn list_doctors(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.list_doctors()?))
}

async fn get_doctor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.get_doctor(&id)?))
}

async fn update_doctor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDoctorFields>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.update_doctor(&id, &body)?))
}

async fn delete_doctor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let db = state.db()?;
    db.delete_doctor(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Accepts either a list of patient ids or a single one.
#[derive(Deserialize)]
struct LinkBody {
    #[serde(default)]
    patient_ids: Vec<String>,
    patient_id: Option<String>,
}

async fn link_patients(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LinkBody>,
) -> Result<impl IntoResponse, AppError> {
    let mut patient_ids = body.patient_ids;
    patient_ids.extend(body.patient_id);
    let db = state.db()?;
    Ok(json(db.link_patients(&id, &patient_ids)?))
}

async fn unlink_patient(
    State(state): State<AppState>,
    Path((id, patient_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let db = state.db()?;
    db.unlink_patient(&id, &patient_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Sleep record endpoints ---

#[derive(Deserialize)]
struct SleepListQuery {
    patient_id: Option<String>,
}

async fn list_sleep_records(
    State(state): State<AppState>,
    Query(query): Query<SleepListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    let records = db.list_sleep_records(query.patient_id.as_deref())?;
    if let Some(patient_id) = &query.patient_id
        && records.is_empty()
    {
        return Err(ClinicError::NotFound(format!("sleep records for patient {patient_id}")).into());
    }
    Ok(json(records))
}

async fn create_sleep_record(
    State(state): State<AppState>,
    Json(body): Json<CreateSleepRecordParams>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    let record = db.create_sleep_record(&body)?;
    Ok((StatusCode::CREATED, json(record)))
}

async fn get_sleep_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.get_sleep_record(id)?))
}

async fn update_sleep_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateSleepRecordFields>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.update_sleep_record(id, &body)?))
}

async fn delete_sleep_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let db = state.db()?;
    let record = db.delete_sleep_record(id)?;
    if let Err(e) = state.uploads.remove_record(&record.patient_id, record.id) {
        tracing::warn!(
            sleep_record_id = id,
            "sleep record deleted but its uploads remain: {e}"
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- File endpoints ---

#[derive(Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

/// One file taken from an upload request, not yet written to disk.
struct IncomingFile {
    filename: String,
    content_type: String,
    bytes: Bytes,
}

impl IncomingFile {
    fn check(&self) -> Result<(), ClinicError> {
        if FileCategory::from_content_type(&self.content_type).is_none() {
            return Err(ClinicError::Validation(format!(
                "{}: unsupported content type {:?}",
                self.filename, self.content_type
            )));
        }
        if self.bytes.is_empty() {
            return Err(ClinicError::Validation(format!(
                "{}: no file content",
                self.filename
            )));
        }
        Ok(())
    }
}

/// Collects every file part of a multipart body. Plain form fields are
/// ignored.
async fn read_multipart(mut multipart: Multipart) -> Result<Vec<IncomingFile>, ClinicError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ClinicError::Validation(format!("malformed upload: {}", e.body_text())))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        if files.len() == MAX_FILES_PER_UPLOAD {
            return Err(ClinicError::Validation(format!(
                "at most {MAX_FILES_PER_UPLOAD} files per upload"
            )));
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ClinicError::Validation(format!("malformed upload: {}", e.body_text())))?;
        files.push(IncomingFile {
            filename,
            content_type,
            bytes,
        });
    }
    if files.is_empty() {
        return Err(ClinicError::Validation("no files in upload".to_string()));
    }
    Ok(files)
}

/// Writes the files and their rows. Nothing is kept if any of them fails.
fn store_files(
    state: &AppState,
    sleep_record_id: i64,
    files: &[IncomingFile],
) -> Result<Vec<FileAttachment>, ClinicError> {
    for file in files {
        file.check()?;
    }

    let db = state.db().map_err(|e| e.0)?;
    let record = db.get_sleep_record_only(sleep_record_id)?;
    let mut saved: Vec<NewAttachment> = Vec::with_capacity(files.len());
    let discard_all = |saved: &[NewAttachment]| {
        for new in saved {
            state.uploads.discard(&record.patient_id, new);
        }
    };

    for file in files {
        match state.uploads.save(
            &record.patient_id,
            sleep_record_id,
            &file.filename,
            &file.content_type,
            &file.bytes,
        ) {
            Ok(new) => saved.push(new),
            Err(e) => {
                discard_all(&saved);
                return Err(e);
            }
        }
    }

    match db.add_attachments(&saved) {
        Ok(added) => {
            for attachment in &added {
                tracing::info!(
                    file_id = attachment.id,
                    sleep_record_id,
                    category = attachment.category.as_str(),
                    size = attachment.size_bytes,
                    "file uploaded"
                );
            }
            Ok(added)
        }
        Err(e) => {
            discard_all(&saved);
            Err(e)
        }
    }
}

/// Accepts either a raw body (one file, named by `?filename=`) or
/// `multipart/form-data` carrying up to [`MAX_FILES_PER_UPLOAD`] files.
async fn upload_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Result<Response, AppError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ClinicError::Validation(e.body_text()))?;
        let incoming = read_multipart(multipart).await?;
        let files = store_files(&state, id, &incoming)?;
        let batch = UploadBatch {
            file_count: files.len(),
            files,
        };
        return Ok((StatusCode::CREATED, json(batch)).into_response());
    }

    let bytes = Bytes::from_request(request, &())
        .await
        .map_err(|e| ClinicError::Validation(e.body_text()))?;
    let incoming = IncomingFile {
        filename: query.filename.unwrap_or_default(),
        content_type,
        bytes,
    };
    let mut files = store_files(&state, id, std::slice::from_ref(&incoming))?;
    match files.pop() {
        Some(attachment) => Ok((StatusCode::CREATED, json(attachment)).into_response()),
        None => Err(ClinicError::Internal("upload stored no file".to_string()).into()),
    }
}

#[derive(Deserialize)]
struct FileListQuery {
    category: Option<FileCategory>,
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<FileListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let db = state.db()?;
    Ok(json(db.list_attachments(id, query.category)?))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let (file, bytes) = {
        let db = state.db()?;
        let file = db.get_attachment(id)?;
        let record = db.get_sleep_record_only(file.sleep_record_id)?;
        let bytes = state.uploads.read(&record.patient_id, &file)?;
        (file, bytes)
    };

    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    let disposition = content_disposition(&file.filename);
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// `inline` disposition carrying the original filename: an ASCII fallback in
/// `filename` and the exact name in `filename*`.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback = sanitize_filename(filename);
    let encoded = utf8_percent_encode(filename, FILENAME_ATTR);
    HeaderValue::from_str(&format!(
        "inline; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or(HeaderValue::from_static("inline"))
}

// --- Translation ---

#[derive(Deserialize)]
struct TranslateBody {
    #[serde(alias = "message")]
    text: String,
}

#[derive(Serialize)]
struct TranslateResponse {
    translation: String,
}

async fn translate(
    State(state): State<AppState>,
    Json(body): Json<TranslateBody>,
) -> Result<impl IntoResponse, AppError> {
    let translator = state
        .translator
        .as_ref()
        .ok_or_else(|| ClinicError::Upstream("translation is not configured".to_string()))?;
    let translation = translator.translate(&body.text).await?;
    Ok(json(TranslateResponse { translation }))
}
