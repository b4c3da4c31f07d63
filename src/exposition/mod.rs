//! Prometheus text exposition handling: parsing, serializing and merging.

pub mod encoder;
pub mod merger;
pub mod parser;

pub use encoder::encode_text;
pub use merger::merge;
pub use parser::parse;
