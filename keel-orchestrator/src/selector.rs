//! Work Selector
//!
//! Merges the two candidate queries (ready work and stalled work) into one
//! dispatch queue ordered by
//! `(priority desc, pipeline created asc, pipeline id asc, order asc, slice asc)`.

use keel_core::domain::work::WorkRequest;
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::repository::{Store, StoreError};

/// Fetches every dispatchable work request, deduplicated and ordered
pub async fn fetch_work(store: &dyn Store) -> Result<Vec<WorkRequest>, StoreError> {
    let mut candidates = store.ready_work().await?;
    candidates.extend(store.stalled_work().await?);

    Ok(order(dedupe(candidates)))
}

/// Keeps the first request per action-instance; later duplicates only
/// contribute environment keys the first one lacks.
pub fn dedupe(candidates: Vec<WorkRequest>) -> Vec<WorkRequest> {
    let mut seen: HashMap<i64, usize> = HashMap::new();
    let mut unique: Vec<WorkRequest> = Vec::with_capacity(candidates.len());

    for request in candidates {
        match seen.get(&request.action_instance_id) {
            Some(&idx) => {
                let kept = &mut unique[idx];
                for (key, value) in request.environment {
                    kept.environment.entry(key).or_insert(value);
                }
            }
            None => {
                seen.insert(request.action_instance_id, unique.len());
                unique.push(request);
            }
        }
    }

    unique
}

pub fn order(mut requests: Vec<WorkRequest>) -> Vec<WorkRequest> {
    requests.sort_by_key(|r| {
        (
            Reverse(r.priority),
            r.pipeline_created,
            r.pipeline_instance_id,
            r.order,
            r.slice,
        )
    });
    requests
}
