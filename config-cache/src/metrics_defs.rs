//! Metrics definitions for the config cache.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DUMP_TASK_SUBMITTED: MetricDef = MetricDef {
    name: "dump.task.submitted",
    metric_type: MetricType::Counter,
    description: "Number of dump tasks submitted to the scheduler",
};

pub const DUMP_TASK_MERGED: MetricDef = MetricDef {
    name: "dump.task.merged",
    metric_type: MetricType::Counter,
    description: "Number of dump tasks that replaced a pending task for the same key and channel",
};

pub const DUMP_TASK_FAILED: MetricDef = MetricDef {
    name: "dump.task.failed",
    metric_type: MetricType::Counter,
    description: "Number of dump tasks dropped after a non-retryable failure",
};

pub const DUMP_TASK_RETRIED: MetricDef = MetricDef {
    name: "dump.task.retried",
    metric_type: MetricType::Counter,
    description: "Number of dump tasks requeued after a transient failure",
};

pub const DUMP_TASK_APPLIED: MetricDef = MetricDef {
    name: "dump.task.applied",
    metric_type: MetricType::Counter,
    description: "Number of dump tasks processed. Tagged with outcome.",
};

pub const DUMP_BULK_ROWS: MetricDef = MetricDef {
    name: "dump.bulk.rows",
    metric_type: MetricType::Histogram,
    description: "Number of rows read by a bulk dump",
};

pub const CHANGE_DETECTOR_PASS_DURATION: MetricDef = MetricDef {
    name: "change_detector.pass.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a change detection pass in seconds",
};

pub const HISTORY_ROWS_REMOVED: MetricDef = MetricDef {
    name: "history.rows.removed",
    metric_type: MetricType::Counter,
    description: "Number of history rows deleted by the retention sweep",
};

pub const QUERY_RESOLVED: MetricDef = MetricDef {
    name: "query.resolved",
    metric_type: MetricType::Counter,
    description: "Number of resolved configuration queries. Tagged with status.",
};

pub const CACHE_KEYS: MetricDef = MetricDef {
    name: "cache.keys",
    metric_type: MetricType::Gauge,
    description: "Number of configuration keys held in the cache",
};

/// Every metric emitted by the config cache.
pub const ALL_METRICS: &[MetricDef] = &[
    DUMP_TASK_SUBMITTED,
    DUMP_TASK_MERGED,
    DUMP_TASK_FAILED,
    DUMP_TASK_RETRIED,
    DUMP_TASK_APPLIED,
    DUMP_BULK_ROWS,
    CHANGE_DETECTOR_PASS_DURATION,
    HISTORY_ROWS_REMOVED,
    QUERY_RESOLVED,
    CACHE_KEYS,
];
