use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::cache::{StudioStorage, content_hash};

const PICK_RECORD_DIR: &str = "picks/records";
pub const PICK_IMAGE_DIR: &str = "picks/images";

/// A favorited generation, mirrored locally so it survives upstream URL
/// expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickRecord {
    pub generation_id: String,
    pub remote_url: String,
    pub local_url: String,
    pub prompt: Option<String>,
    pub created_at: String,
}

pub async fn save_pick_record(storage: &StudioStorage, record: &PickRecord) -> Result<()> {
    let created_at = record.created_at.replace(':', "-");
    let hash = content_hash(&format!("{}:{}", record.generation_id, record.remote_url));
    let file_key = format!("{PICK_RECORD_DIR}/{created_at}_{hash}.json");
    let payload = serde_json::to_vec_pretty(record)?;
    storage.put(&file_key, &payload).await?;
    Ok(())
}

/// Newest first; the timestamp prefix on the file name carries the order.
pub async fn list_pick_records(storage: &StudioStorage, limit: usize) -> Result<Vec<PickRecord>> {
    let dir_path = storage.resolve_path(PICK_RECORD_DIR);
    let mut dir = match fs::read_dir(&dir_path).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries: Vec<PathBuf> = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            entries.push(path);
        }
    }
    entries.sort();
    entries.reverse();

    let mut records = Vec::new();
    for path in entries {
        if records.len() >= limit {
            break;
        }
        let bytes = fs::read(&path).await?;
        if let Ok(record) = serde_json::from_slice::<PickRecord>(&bytes) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(id: &str, created_at: &str) -> PickRecord {
        PickRecord {
            generation_id: id.to_string(),
            remote_url: format!("https://cdn.example.cn/{id}.png"),
            local_url: format!("http://127.0.0.1:3000/cache/picks/images/{id}.png"),
            prompt: Some("摆盘更精致一些".to_string()),
            created_at: created_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_returns_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StudioStorage::new(
            dir.path().to_path_buf(),
            "http://127.0.0.1:3000/cache".to_string(),
        );
        for (id, stamp) in [
            ("p1", "2024-01-01T10:00:00Z"),
            ("p2", "2024-01-02T10:00:00Z"),
            ("p3", "2024-01-03T10:00:00Z"),
        ] {
            save_pick_record(&storage, &pick(id, stamp)).await.unwrap();
        }

        let records = list_pick_records(&storage, 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].generation_id, "p3");
        assert_eq!(records[1].generation_id, "p2");
    }

    #[tokio::test]
    async fn test_list_skips_unreadable_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StudioStorage::new(
            dir.path().to_path_buf(),
            "http://127.0.0.1:3000/cache".to_string(),
        );
        save_pick_record(&storage, &pick("p1", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        storage
            .put("picks/records/zz_broken.json", b"not json")
            .await
            .unwrap();

        let records = list_pick_records(&storage, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].generation_id, "p1");
    }

    #[tokio::test]
    async fn test_empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StudioStorage::new(
            dir.path().to_path_buf(),
            "http://127.0.0.1:3000/cache".to_string(),
        );
        assert!(list_pick_records(&storage, 10).await.unwrap().is_empty());
    }
}
