use std::sync::atomic::{AtomicU32, Ordering};

/// Generates lexicographically sortable, monotonically increasing ids.
///
/// Grounded on the teacher's `uuid::Uuid::new_v4()` id convention, but
/// swapped for a sortable scheme: §8 invariant 2 requires that
/// `a.created_at < b.created_at` implies `a.id < b.id`, which a random v4
/// UUID cannot guarantee. Each id is `<millis since epoch, 13 hex digits>-
/// <per-process sequence, 8 hex digits>-<random suffix>`; the first two
/// components make ids sort correctly even when several are minted within
/// the same millisecond, the random suffix keeps them globally unique
/// across process restarts.
static SEQ: AtomicU32 = AtomicU32::new(0);

pub fn new_sortable_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let rand_suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:013x}-{seq:08x}-{}", &rand_suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_within_same_millisecond() {
        let a = new_sortable_id();
        let b = new_sortable_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_sortable_id()));
        }
    }
}
