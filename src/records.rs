use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

// 后端字段名不稳定，按优先级逐个尝试
const ID_FIELDS: &[&str] = &["id", "generation_id", "upload_id", "uuid"];
const URL_FIELDS: &[&str] = &["url", "image", "image_url", "path"];
const CREATED_AT_FIELDS: &[&str] = &["created_at", "createdAt", "timestamp"];
const PROMPT_FIELDS: &[&str] = &["prompt", "instruction"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRecord {
    pub id: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedRecord {
    pub id: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
}

fn field_as_string(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn first_field(value: &Value, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|field| field_as_string(value, field))
}

fn parse_created_at(value: &Value) -> Option<DateTime<Utc>> {
    let raw = first_field(value, CREATED_AT_FIELDS)?;
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

/// Returns the URL as a string only when it is a directly usable
/// absolute http(s) URL.
pub fn absolute_http_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = Url::parse(trimmed).ok()?;
    match parsed.scheme() {
        "http" | "https" => Some(parsed.to_string()),
        _ => None,
    }
}

fn resolve_record_url(raw: &str, base_url: &str) -> Option<String> {
    if let Some(absolute) = absolute_http_url(raw) {
        return Some(absolute);
    }
    let base = Url::parse(base_url).ok()?;
    base.join(raw.trim()).ok().map(|joined| joined.to_string())
}

pub fn normalize_generated(value: &Value, base_url: &str) -> Option<GeneratedRecord> {
    let id = first_field(value, ID_FIELDS)?;
    let url = first_field(value, URL_FIELDS)
        .and_then(|raw| resolve_record_url(&raw, base_url))?;
    Some(GeneratedRecord {
        id,
        url,
        created_at: parse_created_at(value),
        prompt: first_field(value, PROMPT_FIELDS),
    })
}

pub fn normalize_uploaded(value: &Value, base_url: &str) -> Option<UploadedRecord> {
    let id = first_field(value, ID_FIELDS)?;
    let url = first_field(value, URL_FIELDS)
        .and_then(|raw| resolve_record_url(&raw, base_url))?;
    Some(UploadedRecord {
        id,
        url,
        created_at: parse_created_at(value),
    })
}

pub fn normalize_generated_list(values: &[Value], base_url: &str) -> Vec<GeneratedRecord> {
    values
        .iter()
        .filter_map(|value| normalize_generated(value, base_url))
        .collect()
}

pub fn normalize_uploaded_list(values: &[Value], base_url: &str) -> Vec<UploadedRecord> {
    values
        .iter()
        .filter_map(|value| normalize_uploaded(value, base_url))
        .collect()
}
