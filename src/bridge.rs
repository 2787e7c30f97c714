use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::StudioStorage;

const BRIDGE_DIR: &str = "bridge";

/// Selection handoff written by the onboarding flow and consumed exactly
/// once by the studio page. Every field is optional; `ts` is kept for
/// debugging and never gates the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub uploaded_id: Option<String>,
    pub uploaded_url: Option<String>,
    pub generated_id: Option<String>,
    pub generated_url: Option<String>,
    pub ts: Option<i64>,
}

fn bridge_key(device_id: &str) -> String {
    format!("{BRIDGE_DIR}/{device_id}.json")
}

pub async fn save_bridge(
    storage: &StudioStorage,
    device_id: &str,
    record: &BridgeRecord,
) -> Result<()> {
    let payload = serde_json::to_vec_pretty(record)?;
    storage.put(&bridge_key(device_id), &payload).await?;
    Ok(())
}

/// Atomic read-then-delete. The first call after a save returns the record;
/// every later call returns `None`. A record that fails to parse is
/// consumed and discarded like an absent one.
pub async fn take_bridge(
    storage: &StudioStorage,
    device_id: &str,
) -> Result<Option<BridgeRecord>> {
    let key = bridge_key(device_id);
    let bytes = match storage.get(&key).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    storage.delete(&key).await?;
    Ok(serde_json::from_slice(&bytes).ok())
}
