pub mod device;
pub mod picks;
pub mod storage;

pub use device::{DeviceProfile, load_profile, save_profile};
pub use picks::{PickRecord, list_pick_records, save_pick_record};
pub use storage::{StudioStorage, content_hash};
