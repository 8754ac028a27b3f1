//! Intra-batch deduplication by identifier.

use std::collections::HashMap;

use estate_core::{Batch, Record};

fn outranks(candidate: &Record, current: &Record) -> bool {
    let (c, k) = (
        candidate.non_null_required_fields(),
        current.non_null_required_fields(),
    );
    c > k || (c == k && candidate.collected_at > current.collected_at)
}

/// Keep one record per identifier: the most complete one, ties going to the most
/// recently collected. Output follows first-seen order of each identifier.
pub fn deduplicate(batch: Batch) -> Batch {
    let mut slot_of: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    let mut out: Batch = Vec::with_capacity(batch.len());
    for record in batch {
        match slot_of.get(&record.identifier) {
            Some(&slot) => {
                if outranks(&record, &out[slot]) {
                    out[slot] = record;
                }
            }
            None => {
                slot_of.insert(record.identifier.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}
