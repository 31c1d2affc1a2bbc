//! File-system collaborators used by the `sluice` binary.
//!
//! - [`FileFetcher`]: reads an item given as a path or `file://` URL
//! - [`JsonDecoder`]: parses a payload into a JSON object
//! - [`NdjsonStore`]: appends records to an NDJSON file, skipping keys it
//!   has already written

mod file;
mod json;
mod ndjson;

pub use file::FileFetcher;
pub use json::{JsonDecoder, Record};
pub use ndjson::NdjsonStore;
