use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::StudioStorage;

const DEVICE_DIR: &str = "devices";

/// Stable per-device identity, minted at registration and persisted so the
/// same device keeps resolving to the same upstream user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_id: String,
    pub user_id: String,
    pub created_at: String,
}

impl DeviceProfile {
    pub fn issue(user_id: String) -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            user_id,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

fn profile_key(device_id: &str) -> String {
    format!("{DEVICE_DIR}/{device_id}.json")
}

pub async fn load_profile(
    storage: &StudioStorage,
    device_id: &str,
) -> Result<Option<DeviceProfile>> {
    let bytes = match storage.get(&profile_key(device_id)).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    Ok(serde_json::from_slice(&bytes).ok())
}

pub async fn save_profile(storage: &StudioStorage, profile: &DeviceProfile) -> Result<()> {
    let payload = serde_json::to_vec_pretty(profile)?;
    storage.put(&profile_key(&profile.device_id), &payload).await
}
