// Stats sampler
// Collection summary computed from a bounded sample rather than a full scan


use std::sync::Arc;

use itertools::{Itertools, MinMaxResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;
use crate::database::VectorIndex;
use crate::records::Document;

pub const DEFAULT_SAMPLE_CAP: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub total_count: usize,
    /// False when the total fell back to the sample size
    pub total_is_exact: bool,
    pub sample_size: usize,
    pub unique_senders: Vec<String>,
    pub message_types: Vec<String>,
    pub time_range: TimeRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct StatsSampler {
    index: Arc<dyn VectorIndex>,
    sample_cap: usize,
}

impl StatsSampler {
    #[inline]
    pub fn new(index: Arc<dyn VectorIndex>, sample_cap: usize) -> Self {
        Self {
            index,
            sample_cap: sample_cap.max(1),
        }
    }

    #[inline]
    pub async fn stats(&self) -> Result<CollectionStats> {
        let (total, exact) = match self.index.count().await {
            Ok(total) => (Some(total), true),
            Err(e) => {
                warn!(
                    "Counting '{}' failed, falling back to sample size: {}",
                    self.index.name(),
                    e
                );
                (None, false)
            }
        };

        let limit = total.map_or(self.sample_cap, |t| t.min(self.sample_cap));
        let sample = if limit == 0 {
            Vec::new()
        } else {
            self.index.sample(limit).await?
        };
        debug!("Sampled {} documents from '{}'", sample.len(), self.index.name());

        Ok(CollectionStats {
            total_count: total.unwrap_or(sample.len()),
            total_is_exact: exact,
            sample_size: sample.len(),
            unique_senders: distinct(&sample, |d| d.metadata.sender.as_deref()),
            message_types: distinct(&sample, |d| d.metadata.msg_type.as_deref()),
            time_range: time_range(&sample),
            note: (!exact).then(|| {
                format!(
                    "total count unavailable; reporting the size of a {}-document sample",
                    self.sample_cap
                )
            }),
        })
    }
}

fn distinct<F>(sample: &[Document], field: F) -> Vec<String>
where
    F: Fn(&Document) -> Option<&str>,
{
    sample
        .iter()
        .filter_map(field)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .sorted_unstable()
        .dedup()
        .map(str::to_string)
        .collect()
}

/// Lexicographic bounds of the non-empty chat times.
fn time_range(sample: &[Document]) -> TimeRange {
    let times = sample
        .iter()
        .filter_map(|d| d.metadata.chat_time.as_deref())
        .filter(|t| !t.trim().is_empty());

    match times.minmax() {
        MinMaxResult::NoElements => TimeRange::default(),
        MinMaxResult::OneElement(t) => TimeRange {
            earliest: Some(t.to_string()),
            latest: Some(t.to_string()),
        },
        MinMaxResult::MinMax(earliest, latest) => TimeRange {
            earliest: Some(earliest.to_string()),
            latest: Some(latest.to_string()),
        },
    }
}
