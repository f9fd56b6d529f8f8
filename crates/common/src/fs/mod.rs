pub mod safe_write;

pub use safe_write::{SafeFileWriter, WriteMode};
