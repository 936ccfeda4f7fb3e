pub mod analyzer;
pub mod batcher;
pub mod dataset;
pub mod reader;
pub mod writer;

pub use analyzer::{
    default_columns, estimate_rows_tokens, estimate_tokens, is_numeric_column, summarize_dataset,
    DatasetSummary,
};
pub use batcher::{BatchRange, BatchRanges, RowBatcher};
pub use dataset::{Dataset, Row};
pub use reader::{file_exists, get_file_size, read_dataset_from, CsvStreamReader};
pub use writer::{serialize_csv, CsvStreamWriter};
