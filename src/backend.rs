use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, Instant, sleep};

use crate::records::{self, GeneratedRecord, UploadedRecord};

pub const DEFAULT_API_BASE: &str = "https://api.plating-studio.cn";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

/// Client for the external plating backend. Generation runs in async mode:
/// submit a task, then poll until it settles.
#[derive(Clone)]
pub struct PlatingBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

async fn assert_ok_response(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(anyhow!("摆盘服务请求失败: {status} {text}"))
}

fn extract_list(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for key in ["items", "records", "data", "results"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return items;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn unwrap_record(payload: Value) -> Value {
    if let Value::Object(map) = &payload {
        for key in ["record", "data", "result"] {
            if let Some(inner) = map.get(key) {
                if inner.is_object() {
                    return inner.clone();
                }
            }
        }
    }
    payload
}

fn extract_user_id(payload: &Value) -> Option<String> {
    ["user_id", "id", "uuid"].iter().find_map(|field| {
        payload
            .get(*field)
            .and_then(Value::as_str)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[derive(Debug, Deserialize)]
struct GenerationTaskResponse {
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationStatusResponse {
    task_status: Option<String>,
    generation_id: Option<String>,
    output_images: Option<Vec<String>>,
    error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    code: Option<String>,
    message: Option<String>,
}

impl PlatingBackend {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_key(&self) -> Result<&str> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(anyhow!("missing PLATING_API_KEY"));
        }
        Ok(key)
    }

    pub async fn register_user(&self, nickname: Option<&str>) -> Result<String> {
        let mut body = json!({});
        if let Some(nickname) = nickname {
            if !nickname.trim().is_empty() {
                body["nickname"] = json!(nickname.trim());
            }
        }
        let response = self
            .client
            .post(format!("{}/v1/users", self.base_url))
            .bearer_auth(self.auth_key()?)
            .json(&body)
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: Value = response.json().await?;
        extract_user_id(&unwrap_record(payload))
            .ok_or_else(|| anyhow!("摆盘服务未返回 user_id"))
    }

    pub async fn upload_image(
        &self,
        user_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedRecord> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)?;
        let form = reqwest::multipart::Form::new()
            .text("user_id", user_id.to_string())
            .part("file", part);
        let response = self
            .client
            .post(format!("{}/v1/uploads", self.base_url))
            .bearer_auth(self.auth_key()?)
            .multipart(form)
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: Value = response.json().await?;
        records::normalize_uploaded(&unwrap_record(payload), &self.base_url)
            .ok_or_else(|| anyhow!("摆盘服务上传响应缺少图片记录"))
    }

    pub async fn generate_plating(
        &self,
        user_id: &str,
        upload_id: &str,
        prompt: &str,
    ) -> Result<GeneratedRecord> {
        let response = self
            .client
            .post(format!("{}/v1/generations", self.base_url))
            .bearer_auth(self.auth_key()?)
            .header("X-Plating-Async-Mode", "true")
            .json(&json!({
                "user_id": user_id,
                "upload_id": upload_id,
                "prompt": prompt,
            }))
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: GenerationTaskResponse = response.json().await?;
        let task_id = payload
            .task_id
            .ok_or_else(|| anyhow!("摆盘服务未返回 task_id"))?;

        let (image_url, generation_id) = self.poll_generation_task(&task_id).await?;
        Ok(GeneratedRecord {
            id: generation_id.unwrap_or(task_id),
            url: image_url,
            created_at: Some(Utc::now()),
            prompt: Some(prompt.to_string()),
        })
    }

    async fn poll_generation_task(&self, task_id: &str) -> Result<(String, Option<String>)> {
        let auth_key = self.auth_key()?.to_string();
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let mut poll_count = 0u32;

        while Instant::now() <= deadline {
            poll_count += 1;
            let response = self
                .client
                .get(format!("{}/v1/tasks/{task_id}", self.base_url))
                .bearer_auth(&auth_key)
                .send()
                .await?;
            let response = assert_ok_response(response).await?;
            let response_text = response.text().await?;
            let payload: GenerationStatusResponse = serde_json::from_str(&response_text)
                .map_err(|err| anyhow!("解析任务状态响应失败: {}, 原始响应: {}", err, response_text))?;
            let status = payload
                .task_status
                .ok_or_else(|| anyhow!("摆盘服务未返回任务状态, 原始响应: {}", response_text))?;

            match status.as_str() {
                "SUCCEED" => {
                    let image_url = payload
                        .output_images
                        .and_then(|images| images.into_iter().next())
                        .ok_or_else(|| anyhow!("摆盘服务未返回图片地址"))?;
                    eprintln!("[DEBUG] poll_generation_task: success, image_url={}", image_url);
                    return Ok((image_url, payload.generation_id));
                }
                "FAILED" => {
                    let error_msg = payload
                        .error
                        .map(|err| {
                            format!(
                                "code={}, message={}",
                                err.code.unwrap_or_default(),
                                err.message.unwrap_or_default()
                            )
                        })
                        .unwrap_or_else(|| "未知错误".to_string());
                    return Err(anyhow!("摆盘生成失败: {}", error_msg));
                }
                _ => {
                    eprintln!("[DEBUG] poll_generation_task: status={}, waiting...", status);
                    sleep(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)).await;
                }
            }
        }

        Err(anyhow!(
            "摆盘生成超时 (task_id={task_id}, poll_count={poll_count})"
        ))
    }

    pub async fn list_uploads(&self, user_id: &str) -> Result<Vec<UploadedRecord>> {
        let response = self
            .client
            .get(format!("{}/v1/users/{user_id}/uploads", self.base_url))
            .bearer_auth(self.auth_key()?)
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: Value = response.json().await?;
        Ok(records::normalize_uploaded_list(
            &extract_list(payload),
            &self.base_url,
        ))
    }

    pub async fn list_generations(&self, user_id: &str) -> Result<Vec<GeneratedRecord>> {
        let response = self
            .client
            .get(format!("{}/v1/users/{user_id}/generations", self.base_url))
            .bearer_auth(self.auth_key()?)
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: Value = response.json().await?;
        Ok(records::normalize_generated_list(
            &extract_list(payload),
            &self.base_url,
        ))
    }

    pub async fn feed(&self, limit: usize) -> Result<Vec<GeneratedRecord>> {
        let response = self
            .client
            .get(format!("{}/v1/feed", self.base_url))
            .query(&[("limit", limit)])
            .bearer_auth(self.auth_key()?)
            .send()
            .await?;
        let response = assert_ok_response(response).await?;
        let payload: Value = response.json().await?;
        Ok(records::normalize_generated_list(
            &extract_list(payload),
            &self.base_url,
        ))
    }

    pub async fn save_pick(&self, user_id: &str, generation_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/picks", self.base_url))
            .bearer_auth(self.auth_key()?)
            .json(&json!({
                "user_id": user_id,
                "generation_id": generation_id,
            }))
            .send()
            .await?;
        assert_ok_response(response).await?;
        Ok(())
    }

    pub async fn fetch_image_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self.client.get(url).send().await?;
        let response = assert_ok_response(response).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }
}
