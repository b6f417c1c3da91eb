pub mod labels;
pub mod sample;

pub use labels::{Labels, ALERT_NAME_LABEL, METRIC_NAME_LABEL, SEVERITY_LABEL};
pub use sample::{is_valid_metric_name, MetricSample, Sample};
