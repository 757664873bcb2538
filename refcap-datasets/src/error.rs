use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid annotation at {path:?}:{line}: {source}")]
    Annotation {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("cannot decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("annotation {ann_id} has an empty bounding box {bbox:?}")]
    EmptyBox { ann_id: u64, bbox: [f32; 4] },

    #[error("annotation {ann_id} has no sentences")]
    NoSentences { ann_id: u64 },

    #[error("sample {idx} out of range for a dataset of {len} samples")]
    IndexOutOfRange { idx: usize, len: usize },

    #[error("the tokenizer vocabulary has no {0} token")]
    MissingSpecialToken(&'static str),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Model(#[from] refcap_transformers::Error),

    #[error(transparent)]
    Candle(#[from] candle::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
