//! Caption models for referring-expression generation.
//!
//! A region of an image, optionally with the whole image as context and a location vector, is
//! turned into one or two masked feature streams, encoded by a transformer and decoded into
//! per-token vocabulary logits.
pub mod cider;
pub mod error;
pub mod generation;
pub mod models;
pub mod nested;
pub mod stream;

pub use error::{Error, Result};
pub use nested::NestedTensor;
pub use stream::FeatureStream;
