use crate::models::caption::Variant;
use candle::Shape;

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "unsupported model configuration: use_global_features={use_global}, use_location_features={use_location}"
    )]
    UnsupportedConfiguration { use_global: bool, use_location: bool },

    #[error("shape mismatch in {op}, features: {features:?}, mask: {mask:?}")]
    ShapeMismatch {
        op: &'static str,
        features: Shape,
        mask: Shape,
    },

    #[error("the {variant} model requires a {input} input")]
    MissingInput {
        variant: Variant,
        input: &'static str,
    },

    #[error("unexpected location shape for the {variant} model, expected {expected}, got {got:?}")]
    UnexpectedLocationShape {
        variant: Variant,
        expected: &'static str,
        got: Shape,
    },

    #[error("{op} on a stream without any position")]
    EmptyStream { op: &'static str },

    #[error("cannot build a batch from an empty list of images")]
    EmptyBatch,

    #[error("a context stream was provided but the transformer has no context encoder")]
    MissingContextEncoder,

    #[error("sequence of length {len} exceeds the {max} available positions")]
    SequenceTooLong { len: usize, max: usize },

    #[error(transparent)]
    Candle(#[from] candle::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
