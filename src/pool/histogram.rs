use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const BUCKET_WIDTH_MS: u64 = 50;
/// 20 buckets of 50ms up to one second plus `1000+ms`.
pub const BUCKET_COUNT: usize = 21;

fn bucket_of(wait: Duration) -> usize {
    let ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
    usize::try_from(ms / BUCKET_WIDTH_MS)
        .unwrap_or(BUCKET_COUNT - 1)
        .min(BUCKET_COUNT - 1)
}

pub fn bucket_label(index: usize) -> String {
    if index + 1 >= BUCKET_COUNT {
        return format!("{}+ms", (BUCKET_COUNT as u64 - 1) * BUCKET_WIDTH_MS);
    }
    let lo = index as u64 * BUCKET_WIDTH_MS;
    format!("{lo}-{}ms", lo + BUCKET_WIDTH_MS)
}

/// Connection acquisition wait times.
#[derive(Debug, Default)]
pub struct WaitHistogram {
    buckets: [AtomicU64; BUCKET_COUNT],
}

impl WaitHistogram {
    pub fn record(&self, wait: Duration) {
        self.buckets[bucket_of(wait)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: [u64; BUCKET_COUNT],
}

impl HistogramSnapshot {
    pub fn total_count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn add(&mut self, other: &HistogramSnapshot) {
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            *mine += theirs;
        }
    }

    pub fn count(&self, label: &str) -> Option<u64> {
        (0..BUCKET_COUNT)
            .find(|i| bucket_label(*i) == label)
            .map(|i| self.buckets[i])
    }
}

/// Serializes as `{"0-50ms": {"count": n}, ..., "1000+ms": {...}, "totalCount": n}`.
impl Serialize for HistogramSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(serde::Serialize)]
        struct Count {
            count: u64,
        }
        let mut map = serializer.serialize_map(Some(BUCKET_COUNT + 1))?;
        for (i, count) in self.buckets.iter().enumerate() {
            map.serialize_entry(&bucket_label(i), &Count { count: *count })?;
        }
        map.serialize_entry("totalCount", &self.total_count())?;
        map.end()
    }
}
