//! # util
//!
//! why: share the entry-size arithmetic used by the log, storage and flow control
//! relations: used by log.rs, log_unstable.rs, storage.rs, node.rs, raw_node.rs
//! what: NO_LIMIT, limit_size, entries_size, payloads_size

use crate::entry::LogEntry;

/// Size cap meaning "unbounded".
pub const NO_LIMIT: u64 = u64::MAX;

/// Truncates `entries` to its longest prefix whose total encoded size does
/// not exceed `max_size`.
///
/// A non-empty input always keeps at least its first entry, even when that
/// entry alone is over the cap, so an oversized entry can never stall
/// replication.
pub fn limit_size(entries: &mut Vec<LogEntry>, max_size: u64) {
    if entries.len() <= 1 || max_size == NO_LIMIT {
        return;
    }
    let mut size = 0u64;
    let limit = entries
        .iter()
        .take_while(|e| {
            if size == 0 {
                size = e.encoded_size();
                return true;
            }
            size = size.saturating_add(e.encoded_size());
            size <= max_size
        })
        .count();
    entries.truncate(limit);
}

/// Total encoded size of `entries`.
pub fn entries_size(entries: &[LogEntry]) -> u64 {
    entries.iter().map(LogEntry::encoded_size).sum()
}

/// Total payload size of `entries`.
pub fn payloads_size(entries: &[LogEntry]) -> u64 {
    entries.iter().map(LogEntry::payload_size).sum()
}
