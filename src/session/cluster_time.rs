use std::sync::{Arc, RwLock};

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// A `$clusterTime` document gossipped by the server: the logical timestamp
/// plus the server's signature over it. Ordering is by the embedded timestamp
/// alone; the signature is opaque to the driver.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    pub(crate) signature: Document,
}

impl ClusterTime {
    /// The logical timestamp this cluster time carries.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }

    #[cfg(test)]
    pub(crate) fn new_testing(time: u32, increment: u32) -> Self {
        Self {
            cluster_time: Timestamp { time, increment },
            signature: Document::new(),
        }
    }
}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A shared, monotone holder of the most recent cluster time the process has
/// seen. Cheap to clone; all clones observe the same clock.
#[derive(Clone, Debug, Default)]
pub struct ClusterClock {
    current: Arc<RwLock<Option<ClusterTime>>>,
}

impl ClusterClock {
    /// Creates a clock with no cluster time recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent cluster time observed, if any.
    pub fn current(&self) -> Option<ClusterTime> {
        self.current.read().unwrap().clone()
    }

    /// Merges `to` into the clock, keeping whichever cluster time carries the
    /// greater timestamp. Monotone under concurrent advances.
    pub fn advance(&self, to: &ClusterTime) {
        let mut current = self.current.write().unwrap();
        if current.as_ref().map(|cur| cur < to).unwrap_or(true) {
            *current = Some(to.clone());
        }
    }
}
