pub mod error;
pub mod fs;

pub use error::{CompressorError, CompressorResult};
pub use fs::sanitize_filename;
