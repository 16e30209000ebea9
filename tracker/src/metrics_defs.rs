//! Metrics definitions for the traffic tracker.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
}

pub const SYNC_CYCLE_DURATION: MetricDef = MetricDef {
    name: "sync.cycle.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a sync cycle over all tracked repositories in seconds",
};

pub const SYNC_REPOSITORY_SUCCESS: MetricDef = MetricDef {
    name: "sync.repository.success",
    metric_type: MetricType::Counter,
    description: "Number of repositories synced successfully",
};

pub const SYNC_REPOSITORY_FAILURE: MetricDef = MetricDef {
    name: "sync.repository.failure",
    metric_type: MetricType::Counter,
    description: "Number of repositories whose sync failed",
};

pub const SYNC_RECORD_SKIPPED: MetricDef = MetricDef {
    name: "sync.record.skipped",
    metric_type: MetricType::Counter,
    description: "Number of malformed upstream traffic entries skipped during normalization",
};

pub const STORAGE_FALLBACK: MetricDef = MetricDef {
    name: "storage.fallback",
    metric_type: MetricType::Counter,
    description: "Number of times storage fell back to an alternate backend or location",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_CYCLE_DURATION,
    SYNC_REPOSITORY_SUCCESS,
    SYNC_REPOSITORY_FAILURE,
    SYNC_RECORD_SKIPPED,
    STORAGE_FALLBACK,
];
