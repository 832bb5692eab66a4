pub mod file;

pub use file::{write_rows, CsvRow, CsvSink};
