//! Per-series merge of tier partials.
//!
//! Each query id gets its page, memory and WAL partials materialized
//! separately; when the three are internally ordered and their time
//! ranges line up oldest-tier-first, plain concatenation preserves order.
//! Any overlap falls back to one stable sort by time, which keeps
//! insertion order on ties.

use crate::types::Sample;

fn sorted_within(samples: &[Sample]) -> bool {
    samples.windows(2).all(|w| w[0].time <= w[1].time)
}

fn boundary_ok(older: &[Sample], newer: &[Sample]) -> bool {
    match (older.last(), newer.first()) {
        (Some(a), Some(b)) => a.time <= b.time,
        _ => true,
    }
}

/// Merge one id's tier partials into a single time-sorted stream.
#[must_use]
pub fn merge(page: Vec<Sample>, memory: Vec<Sample>, wal: Vec<Sample>) -> Vec<Sample> {
    let already_ordered = sorted_within(&page)
        && sorted_within(&memory)
        && sorted_within(&wal)
        && boundary_ok(&page, &memory)
        && boundary_ok(&memory, &wal)
        && boundary_ok(&page, &wal);
    let mut all = page;
    all.extend(memory);
    all.extend(wal);
    if !already_ordered {
        all.sort_by_key(|s| s.time);
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(time: u64, value: f64) -> Sample {
        Sample::new(1, time, value, 0)
    }

    #[test]
    fn disjoint_tiers_concatenate() {
        let page = vec![s(1, 0.1), s(2, 0.2)];
        let memory = vec![s(3, 0.3)];
        let wal = vec![s(4, 0.4), s(5, 0.5)];
        let merged = merge(page, memory, wal);
        assert_eq!(merged.iter().map(|m| m.time).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn overlap_forces_time_sort() {
        let page = vec![s(1, 0.0), s(10, 0.0)];
        let memory = vec![s(5, 0.0)];
        let wal = vec![s(7, 0.0)];
        let merged = merge(page, memory, wal);
        assert_eq!(merged.iter().map(|m| m.time).collect::<Vec<_>>(), vec![1, 5, 7, 10]);
    }

    #[test]
    fn equal_times_keep_insertion_order() {
        let page = vec![s(5, 1.0)];
        let memory = vec![s(5, 2.0)];
        let wal = vec![s(2, 3.0)];
        let merged = merge(page, memory, wal);
        assert_eq!(merged.iter().map(|m| m.time).collect::<Vec<_>>(), vec![2, 5, 5]);
        // stable: page sample first among the time-5 pair
        assert_eq!(merged[1].value, 1.0);
        assert_eq!(merged[2].value, 2.0);
    }

    #[test]
    fn empty_partials_are_fine() {
        assert!(merge(Vec::new(), Vec::new(), Vec::new()).is_empty());
        let only_wal = merge(Vec::new(), Vec::new(), vec![s(9, 0.0)]);
        assert_eq!(only_wal.len(), 1);
    }
}
