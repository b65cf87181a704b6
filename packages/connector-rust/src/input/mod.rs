//! Read side: split planning and replica-aware record readers.

mod format;
mod reader;
mod split;

pub use format::{parse_split_stream, ContentInputFormat, SplitStream, SPLIT_QUERY};
pub use reader::{DocumentRecord, ForestRecordReader};
pub use split::{interleave_splits, plan_splits, split_forest, ForestRecordCount, ForestSplit};
