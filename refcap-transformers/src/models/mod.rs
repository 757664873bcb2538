//! Candle implementations of the caption model and its building blocks.
pub mod backbone;
pub mod caption;
pub mod concat_transformer;
pub mod with_tracing;
