//! Write side: output format and the batched content writer.

mod format;
mod writer;

pub use format::ContentOutputFormat;
pub use writer::{ContentWriter, ForestWriterState, SlotState, WriterStats};
