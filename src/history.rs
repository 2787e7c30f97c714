use crate::records::GeneratedRecord;

/// Free-tier generated-image quota per device.
pub const HISTORY_CAP: usize = 5;

/// Sorts ascending by `created_at` (missing timestamps sort earliest) and
/// keeps the most recent `cap` entries, still in ascending order. Stable,
/// so ties keep their insertion order.
pub fn normalize(list: &[GeneratedRecord], cap: usize) -> Vec<GeneratedRecord> {
    let mut ordered = list.to_vec();
    ordered.sort_by_key(|record| record.created_at);
    let skip = ordered.len().saturating_sub(cap);
    ordered.split_off(skip)
}

/// Sole insertion path for the history. The oldest record falls off first
/// once the combined size exceeds `cap`. No dedup by id.
pub fn append_with_cap(
    existing: &[GeneratedRecord],
    record: GeneratedRecord,
    cap: usize,
) -> Vec<GeneratedRecord> {
    let mut combined = existing.to_vec();
    combined.push(record);
    normalize(&combined, cap)
}

/// Paywall gate. Callers must check this before requesting a generation,
/// never after.
pub fn has_reached_cap(list: &[GeneratedRecord], cap: usize) -> bool {
    list.len() >= cap
}

/// Number of empty slots the thumbnail strip shows next to real entries.
pub fn placeholders_count(list: &[GeneratedRecord], cap: usize) -> usize {
    cap.saturating_sub(list.len())
}
