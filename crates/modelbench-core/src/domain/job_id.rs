//! Job identifiers and their allocator.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::request::RunRequest;

/// Correlates every event of one run: `{version}-{model}-{millis}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(raw: &str) -> Self {
        JobId(raw.to_string())
    }
}

/// Mints job ids from the request fields and a wall-clock millisecond stamp.
///
/// The stamp is bumped past the last one issued, so ids from one allocator
/// never repeat even when requests land in the same millisecond.
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    last_millis: AtomicI64,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, request: &RunRequest) -> JobId {
        let millis = self.stamp(Utc::now().timestamp_millis());
        JobId(format!("{}-{}-{}", request.version, request.model, millis))
    }

    fn stamp(&self, now: i64) -> i64 {
        let mut last = self.last_millis.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_millis.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_id_composes_request_fields() {
        let ids = JobIdAllocator::new();
        let id = ids.next(&RunRequest::new("v1", "knn"));
        assert!(id.as_str().starts_with("v1-knn-"));
        let millis: i64 = id.as_str()["v1-knn-".len()..].parse().expect("numeric stamp");
        assert!(millis > 0);
    }

    #[test]
    fn test_stamp_is_strictly_increasing_within_one_millisecond() {
        let ids = JobIdAllocator::new();
        assert_eq!(ids.stamp(1_000), 1_000);
        assert_eq!(ids.stamp(1_000), 1_001);
        assert_eq!(ids.stamp(999), 1_002);
        assert_eq!(ids.stamp(5_000), 5_000);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = Arc::new(JobIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ids.next(&RunRequest::new("v1", "gmm")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
