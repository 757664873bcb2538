//! Referring-expression datasets, image transforms and batching for refcap.
pub mod batcher;
pub mod error;
pub mod refexp;
pub mod tokenizer;
pub mod transforms;

pub use batcher::{Batch, Batcher};
pub use error::{Error, Result};
