use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::bridge::BridgeRecord;
use crate::history::{self, HISTORY_CAP};
use crate::records::{self, GeneratedRecord, UploadedRecord};

/// Studio state for one device. All mutation goes through the methods
/// below; the history in particular is only ever written via the capped
/// append path.
#[derive(Debug, Default)]
pub struct StudioSession {
    pub uploads: Vec<UploadedRecord>,
    pub history: Vec<GeneratedRecord>,
    pub selected_upload: Option<UploadedRecord>,
    pub selected_generated: Option<GeneratedRecord>,
    pub hydrated: bool,
    pub generating: bool,
}

/// Snapshot handed to the studio page.
#[derive(Debug, Clone, Serialize)]
pub struct StudioView {
    pub uploads: Vec<UploadedRecord>,
    pub selected_upload: Option<UploadedRecord>,
    pub history: Vec<GeneratedRecord>,
    pub selected_generated: Option<GeneratedRecord>,
    pub cap_reached: bool,
    pub placeholders: usize,
}

impl StudioSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the backend listings into the session. Runs once per mount;
    /// the history passes through the cap on the way in.
    pub fn hydrate(&mut self, uploads: Vec<UploadedRecord>, generated: Vec<GeneratedRecord>) {
        self.uploads = uploads;
        self.history = history::normalize(&generated, HISTORY_CAP);
        if self.selected_upload.is_none() {
            self.selected_upload = self.uploads.first().cloned();
        }
        if self.selected_generated.is_none() {
            self.selected_generated = self.history.last().cloned();
        }
        self.hydrated = true;
    }

    pub fn record_upload(&mut self, record: UploadedRecord) {
        self.uploads.insert(0, record.clone());
        self.selected_upload = Some(record);
    }

    pub fn record_generation(&mut self, record: GeneratedRecord) {
        self.history = history::append_with_cap(&self.history, record.clone(), HISTORY_CAP);
        self.selected_generated = Some(record);
    }

    /// Applies a taken bridge record. Left side: a directly usable absolute
    /// URL wins, then an id match against the loaded uploads, then the
    /// first loaded upload. Right side only applies when the bridge carries
    /// both an id and an absolute URL, and inserts through the capped
    /// append path.
    pub fn merge_bridge(&mut self, bridge: &BridgeRecord) {
        let direct_url = bridge
            .uploaded_url
            .as_deref()
            .and_then(records::absolute_http_url);
        if let Some(url) = direct_url {
            let record = UploadedRecord {
                id: bridge
                    .uploaded_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                url,
                created_at: Some(Utc::now()),
            };
            self.record_upload(record);
        } else if let Some(found) = bridge.uploaded_id.as_deref().and_then(|id| {
            self.uploads
                .iter()
                .find(|upload| upload.id == id)
                .cloned()
        }) {
            self.selected_upload = Some(found);
        } else if self.selected_upload.is_none() {
            self.selected_upload = self.uploads.first().cloned();
        }

        let bridged_generated_url = bridge
            .generated_url
            .as_deref()
            .and_then(records::absolute_http_url);
        if let (Some(id), Some(url)) = (bridge.generated_id.as_deref(), bridged_generated_url) {
            let record = GeneratedRecord {
                id: id.to_string(),
                url,
                created_at: Some(Utc::now()),
                prompt: None,
            };
            self.record_generation(record);
        }
    }

    pub fn view(&self) -> StudioView {
        StudioView {
            uploads: self.uploads.clone(),
            selected_upload: self.selected_upload.clone(),
            history: self.history.clone(),
            selected_generated: self.selected_generated.clone(),
            cap_reached: history::has_reached_cap(&self.history, HISTORY_CAP),
            placeholders: history::placeholders_count(&self.history, HISTORY_CAP),
        }
    }
}
