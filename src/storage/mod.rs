pub mod engine;
pub mod series;

pub use engine::{SeriesStore, SeriesWindow, StorageError, StoreStats, DEFAULT_RETENTION_MS};
pub use series::{AppendResult, Series};
