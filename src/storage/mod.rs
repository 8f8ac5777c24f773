pub mod sqlite;

pub use sqlite::{MetricsRecord, ReviewRecord, ReviewSummaryRow, Storage};
