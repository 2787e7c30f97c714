use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

use crate::backend::PlatingBackend;
use crate::bridge::{self, BridgeRecord};
use crate::cache::{self, DeviceProfile, PickRecord, StudioStorage};
use crate::history::{self, HISTORY_CAP};
use crate::image_meta;
use crate::records::{self, GeneratedRecord};
use crate::session::{StudioSession, StudioView};

const ONBOARD_HTML: &str = include_str!("../templates/onboard.html");
const STUDIO_HTML: &str = include_str!("../templates/studio.html");
const GALLERY_HTML: &str = include_str!("../templates/gallery.html");

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StudioStorage>,
    pub backend: Arc<PlatingBackend>,
    pub sessions: Arc<Mutex<HashMap<String, StudioSession>>>,
}

impl AppState {
    pub fn new(storage: StudioStorage, backend: PlatingBackend) -> Self {
        Self {
            storage: Arc::new(storage),
            backend: Arc::new(backend),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_router(state: AppState, data_dir: PathBuf) -> Router {
    Router::new()
        .route("/", get(onboard_page))
        .route("/studio", get(studio_page))
        .route("/gallery", get(gallery_page))
        .route("/api/register", post(register))
        .route(
            "/api/upload",
            post(upload_image).layer(DefaultBodyLimit::max(50 * 1024 * 1024)),
        )
        .route("/api/generate", post(generate_plating))
        .route("/api/studio", get(studio_state))
        .route("/api/bridge", post(save_bridge_state))
        .route("/api/feed", get(feed))
        .route("/api/picks", get(list_picks).post(save_pick))
        .nest_service("/cache", ServeDir::new(data_dir))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn require_profile(state: &AppState, device_id: &str) -> Result<DeviceProfile, Response> {
    match cache::load_profile(&state.storage, device_id).await {
        Ok(Some(profile)) => Ok(profile),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "设备未注册")),
        Err(err) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("读取设备信息失败: {err}"),
        )),
    }
}

pub async fn onboard_page() -> Html<&'static str> {
    Html(ONBOARD_HTML)
}

pub async fn studio_page() -> Html<&'static str> {
    Html(STUDIO_HTML)
}

pub async fn gallery_page() -> Html<&'static str> {
    Html(GALLERY_HTML)
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub nickname: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub device_id: String,
    pub user_id: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let user_id = match state.backend.register_user(request.nickname.as_deref()).await {
        Ok(user_id) => user_id,
        Err(err) => return json_error(StatusCode::BAD_GATEWAY, &format!("注册失败: {err}")),
    };
    let profile = DeviceProfile::issue(user_id);
    if let Err(err) = cache::save_profile(&state.storage, &profile).await {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("保存设备信息失败: {err}"),
        );
    }
    (
        StatusCode::OK,
        Json(RegisterResponse {
            device_id: profile.device_id,
            user_id: profile.user_id,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct DeviceQuery {
    pub device_id: String,
}

pub async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    mut multipart: Multipart,
) -> Response {
    let profile = match require_profile(&state, &query.device_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    let mut file_name = None;
    let mut bytes = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("file") {
                    file_name = Some(field.file_name().unwrap_or("").to_string());
                    match field.bytes().await {
                        Ok(data) => {
                            bytes = Some(data);
                        }
                        Err(err) => {
                            return json_error(
                                StatusCode::BAD_REQUEST,
                                &format!("读取文件失败: {err}"),
                            );
                        }
                    }
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("读取表单失败: {err}"));
            }
        }
    }

    let bytes = match bytes {
        Some(data) => data,
        None => return json_error(StatusCode::BAD_REQUEST, "未找到上传文件"),
    };
    if bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "上传文件为空");
    }
    let mime_type = match image_meta::detect_mime_type(&bytes) {
        Some(mime_type) => mime_type,
        None => return json_error(StatusCode::BAD_REQUEST, "文件类型不支持"),
    };
    if let Err(err) = image_meta::probe_dimensions(&bytes, mime_type) {
        return json_error(StatusCode::BAD_REQUEST, &format!("图片无法解析: {err}"));
    }

    let file_name = match file_name.filter(|name| !name.trim().is_empty()) {
        Some(name) => name,
        None => format!("upload.{}", image_meta::extension_for_mime(mime_type)),
    };
    let record = match state
        .backend
        .upload_image(&profile.user_id, &file_name, mime_type, bytes.to_vec())
        .await
    {
        Ok(record) => record,
        Err(err) => return json_error(StatusCode::BAD_GATEWAY, &format!("上传失败: {err}")),
    };

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .entry(query.device_id.clone())
        .or_insert_with(StudioSession::new);
    session.record_upload(record.clone());
    (StatusCode::OK, Json(record)).into_response()
}

#[derive(Deserialize)]
pub struct GenerateRequest {
    pub device_id: String,
    pub upload_id: Option<String>,
    pub prompt: String,
}

#[derive(Serialize)]
pub struct GenerateResponse {
    pub record: GeneratedRecord,
    pub view: StudioView,
}

pub async fn generate_plating(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "prompt不能为空");
    }
    let profile = match require_profile(&state, &request.device_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    // 先问额度再调用：额度用完时绝不发起生成请求
    let source_id = {
        let mut sessions = state.sessions.lock().await;
        let session = sessions
            .entry(request.device_id.clone())
            .or_insert_with(StudioSession::new);
        if history::has_reached_cap(&session.history, HISTORY_CAP) {
            return json_error(StatusCode::PAYMENT_REQUIRED, "生成次数已达上限，请升级后继续");
        }
        if session.generating {
            return json_error(StatusCode::CONFLICT, "已有生成任务进行中");
        }
        let source_id = request
            .upload_id
            .clone()
            .or_else(|| session.selected_upload.as_ref().map(|upload| upload.id.clone()));
        let source_id = match source_id {
            Some(id) => id,
            None => return json_error(StatusCode::BAD_REQUEST, "请先上传图片"),
        };
        session.generating = true;
        source_id
    };

    let result = state
        .backend
        .generate_plating(&profile.user_id, &source_id, request.prompt.trim())
        .await;

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .entry(request.device_id.clone())
        .or_insert_with(StudioSession::new);
    session.generating = false;
    match result {
        Ok(record) => {
            session.record_generation(record.clone());
            (
                StatusCode::OK,
                Json(GenerateResponse {
                    record,
                    view: session.view(),
                }),
            )
                .into_response()
        }
        Err(err) => json_error(StatusCode::BAD_GATEWAY, &format!("摆盘生成失败: {err}")),
    }
}

pub async fn studio_state(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let profile = match require_profile(&state, &query.device_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    let needs_hydrate = {
        let sessions = state.sessions.lock().await;
        sessions
            .get(&query.device_id)
            .map(|session| !session.hydrated)
            .unwrap_or(true)
    };
    let mut listings = None;
    if needs_hydrate {
        let uploads = match state.backend.list_uploads(&profile.user_id).await {
            Ok(uploads) => uploads,
            Err(err) => {
                return json_error(StatusCode::BAD_GATEWAY, &format!("获取上传列表失败: {err}"));
            }
        };
        let generated = match state.backend.list_generations(&profile.user_id).await {
            Ok(generated) => generated,
            Err(err) => {
                return json_error(StatusCode::BAD_GATEWAY, &format!("获取生成列表失败: {err}"));
            }
        };
        listings = Some((uploads, generated));
    }

    // 桥接记录只消费一次；读不到或解析失败都按“无可合并”处理
    let bridged = bridge::take_bridge(&state.storage, &query.device_id)
        .await
        .ok()
        .flatten();

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .entry(query.device_id.clone())
        .or_insert_with(StudioSession::new);
    if let Some((uploads, generated)) = listings {
        if !session.hydrated {
            session.hydrate(uploads, generated);
        }
    }
    if let Some(record) = bridged {
        session.merge_bridge(&record);
    }
    (StatusCode::OK, Json(session.view())).into_response()
}

#[derive(Deserialize)]
pub struct BridgeRequest {
    pub device_id: String,
    pub uploaded_id: Option<String>,
    pub uploaded_url: Option<String>,
    pub generated_id: Option<String>,
    pub generated_url: Option<String>,
}

pub async fn save_bridge_state(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> Response {
    if let Err(response) = require_profile(&state, &request.device_id).await {
        return response;
    }
    let record = BridgeRecord {
        uploaded_id: request.uploaded_id,
        uploaded_url: request.uploaded_url,
        generated_id: request.generated_id,
        generated_url: request.generated_url,
        ts: Some(Utc::now().timestamp_millis()),
    };
    match bridge::save_bridge(&state.storage, &request.device_id, &record).await {
        Ok(()) => (StatusCode::OK, Json(record)).into_response(),
        Err(err) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("保存桥接状态失败: {err}"),
        ),
    }
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn feed(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(30).clamp(1, 100);
    match state.backend.feed(limit).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => json_error(StatusCode::BAD_GATEWAY, &format!("获取作品流失败: {err}")),
    }
}

#[derive(Deserialize)]
pub struct PickRequest {
    pub device_id: String,
    pub generation_id: String,
    // 作品流里的生成记录不在本设备历史中，由请求直接携带地址
    pub url: Option<String>,
    pub prompt: Option<String>,
}

pub async fn save_pick(
    State(state): State<AppState>,
    Json(request): Json<PickRequest>,
) -> Response {
    let profile = match require_profile(&state, &request.device_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };
    let record = {
        let sessions = state.sessions.lock().await;
        sessions.get(&request.device_id).and_then(|session| {
            session
                .history
                .iter()
                .find(|record| record.id == request.generation_id)
                .cloned()
        })
    };
    let record = match record {
        Some(record) => record,
        None => match request.url.as_deref().and_then(records::absolute_http_url) {
            Some(url) => GeneratedRecord {
                id: request.generation_id.clone(),
                url,
                created_at: None,
                prompt: request.prompt.clone(),
            },
            None => return json_error(StatusCode::NOT_FOUND, "未找到生成记录"),
        },
    };
    if let Err(err) = state
        .backend
        .save_pick(&profile.user_id, &request.generation_id)
        .await
    {
        return json_error(StatusCode::BAD_GATEWAY, &format!("收藏失败: {err}"));
    }

    // 本地镜像失败不影响收藏本身
    let local_url = mirror_pick_image(&state, &record)
        .await
        .unwrap_or_else(|| record.url.clone());
    let pick = PickRecord {
        generation_id: record.id.clone(),
        remote_url: record.url.clone(),
        local_url,
        prompt: record.prompt.clone(),
        created_at: Utc::now().to_rfc3339(),
    };
    let _ = cache::save_pick_record(&state.storage, &pick).await;
    (StatusCode::OK, Json(pick)).into_response()
}

async fn mirror_pick_image(state: &AppState, record: &GeneratedRecord) -> Option<String> {
    let (bytes, content_type) = state.backend.fetch_image_bytes(&record.url).await.ok()?;
    let mime_type = image_meta::detect_mime_type(&bytes)
        .map(str::to_string)
        .or(content_type)?;
    let ext = image_meta::extension_for_mime(&mime_type);
    let key = format!(
        "{}/{}.{ext}",
        cache::picks::PICK_IMAGE_DIR,
        cache::content_hash(&record.url)
    );
    state.storage.put(&key, &bytes).await.ok()?;
    Some(state.storage.public_url(&key))
}

pub async fn list_picks(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match cache::list_pick_records(&state.storage, limit).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("读取收藏失败: {err}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::backend::DEFAULT_API_BASE;
    use crate::records::UploadedRecord;

    fn dated(id: &str, day: u32) -> GeneratedRecord {
        GeneratedRecord {
            id: id.to_string(),
            url: format!("https://cdn.example.cn/{id}.png"),
            created_at: Some(
                chrono::DateTime::parse_from_rfc3339(&format!("2024-01-{day:02}T00:00:00Z"))
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            prompt: None,
        }
    }

    async fn test_state(dir: &tempfile::TempDir) -> (AppState, String) {
        let storage = StudioStorage::new(
            dir.path().to_path_buf(),
            "http://127.0.0.1:3000/cache".to_string(),
        );
        let state = AppState::new(
            storage,
            PlatingBackend::new(DEFAULT_API_BASE.to_string(), "test-key".to_string()),
        );
        let profile = DeviceProfile::issue("user-1".to_string());
        cache::save_profile(&state.storage, &profile).await.unwrap();
        let device_id = profile.device_id.clone();
        (state, device_id)
    }

    fn generate_request(device_id: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/generate")
            .header("content-type", "application/json")
            .body(Body::from(format!(
                "{{\"device_id\":\"{device_id}\",\"upload_id\":\"u1\",\"prompt\":\"精致摆盘\"}}"
            )))
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_refuses_at_cap_without_calling_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let (state, device_id) = test_state(&dir).await;
        {
            let mut sessions = state.sessions.lock().await;
            let session = sessions
                .entry(device_id.clone())
                .or_insert_with(StudioSession::new);
            session.hydrated = true;
            session.history = (1..=5).map(|day| dated("g", day)).collect();
        }

        // the configured upstream is unreachable, so anything but the gate
        // branch would not come back with 402
        let router = build_router(state, dir.path().to_path_buf());
        let response = router.oneshot(generate_request(&device_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_generate_refuses_while_one_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (state, device_id) = test_state(&dir).await;
        {
            let mut sessions = state.sessions.lock().await;
            let session = sessions
                .entry(device_id.clone())
                .or_insert_with(StudioSession::new);
            session.hydrated = true;
            session.generating = true;
        }

        let router = build_router(state, dir.path().to_path_buf());
        let response = router.oneshot(generate_request(&device_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_generate_rejects_unregistered_device() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _device_id) = test_state(&dir).await;
        let router = build_router(state, dir.path().to_path_buf());
        let response = router.oneshot(generate_request("unknown")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bridge_roundtrip_merges_once_into_studio_state() {
        let dir = tempfile::tempdir().unwrap();
        let (state, device_id) = test_state(&dir).await;
        {
            // hydrated session keeps the studio handler off the network
            let mut sessions = state.sessions.lock().await;
            let session = sessions
                .entry(device_id.clone())
                .or_insert_with(StudioSession::new);
            session.hydrated = true;
            session.uploads = vec![UploadedRecord {
                id: "u1".to_string(),
                url: "https://cdn.example.cn/u1.jpg".to_string(),
                created_at: None,
            }];
        }
        let router = build_router(state, dir.path().to_path_buf());

        let bridge_body = format!(
            "{{\"device_id\":\"{device_id}\",\"generated_id\":\"g1\",\"generated_url\":\"https://x/y.png\"}}"
        );
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/bridge")
                    .header("content-type", "application/json")
                    .body(Body::from(bridge_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let studio_uri = format!("/api/studio?device_id={device_id}");
        let response = router
            .clone()
            .oneshot(Request::builder().uri(&studio_uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["history"].as_array().unwrap().len(), 1);
        assert_eq!(view["history"][0]["id"], "g1");
        assert_eq!(view["selected_upload"]["id"], "u1");
        assert_eq!(view["placeholders"], 4);

        // remount: the bridge was consumed, g1 is not re-inserted
        let response = router
            .oneshot(Request::builder().uri(&studio_uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (state, device_id) = test_state(&dir).await;
        {
            let mut sessions = state.sessions.lock().await;
            sessions
                .entry(device_id.clone())
                .or_insert_with(StudioSession::new)
                .hydrated = true;
        }
        let router = build_router(state, dir.path().to_path_buf());

        let boundary = "X-PLATING-TEST";
        let body = format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n\r\nnot an image\r\n--{boundary}--\r\n"
        );
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/upload?device_id={device_id}"))
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
