//! Caption tokenization on top of a BERT style `tokenizers` vocabulary.
use crate::{Error, Result};
use std::path::Path;
use tokenizers::Tokenizer;

pub const START_TOKEN: &str = "[CLS]";
pub const END_TOKEN: &str = "[SEP]";
pub const PAD_TOKEN: &str = "[PAD]";

#[derive(Clone)]
pub struct CaptionTokenizer {
    tokenizer: Tokenizer,
    start_token: u32,
    end_token: u32,
    pad_token: u32,
    max_length: usize,
}

impl CaptionTokenizer {
    /// `max_length` counts the start and end tokens.
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::Tokenizer(format!(
                "max_length {max_length} leaves no room for the start and end tokens"
            )));
        }
        let id = |token: &'static str| {
            tokenizer
                .token_to_id(token)
                .ok_or(Error::MissingSpecialToken(token))
        };
        let start_token = id(START_TOKEN)?;
        let end_token = id(END_TOKEN)?;
        let pad_token = id(PAD_TOKEN)?;
        Ok(Self {
            tokenizer,
            start_token,
            end_token,
            pad_token,
            max_length,
        })
    }

    pub fn from_file<P: AsRef<Path>>(p: P, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(p).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, max_length)
    }

    pub fn start_token(&self) -> u32 {
        self.start_token
    }

    pub fn end_token(&self) -> u32 {
        self.end_token
    }

    pub fn pad_token(&self) -> u32 {
        self.pad_token
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Returns `max_length` token ids, `[CLS] caption [SEP]` followed by padding, and the
    /// matching mask with `1` on the padded positions.
    pub fn encode(&self, caption: &str) -> Result<(Vec<u32>, Vec<u8>)> {
        let encoding = self
            .tokenizer
            .encode(caption, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(self.start_token);
        ids.extend(encoding.get_ids().iter().take(self.max_length - 2));
        ids.push(self.end_token);
        let mut mask = vec![0u8; ids.len()];
        ids.resize(self.max_length, self.pad_token);
        mask.resize(self.max_length, 1);
        Ok((ids, mask))
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}
