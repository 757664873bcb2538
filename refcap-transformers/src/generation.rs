//! Greedy caption decoding.
use crate::models::caption::{CaptionInputs, CaptionModel};
use crate::Result;
use candle::{DType, IndexOp, Tensor, D};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreedyDecoder {
    start_token: u32,
    end_token: u32,
    max_length: usize,
}

impl GreedyDecoder {
    /// `max_length` counts the start token and should not exceed the number of position
    /// embeddings of the model.
    pub fn new(start_token: u32, end_token: u32, max_length: usize) -> Self {
        Self {
            start_token,
            end_token,
            max_length,
        }
    }

    /// Generates one token sequence per sample, start and end tokens excluded.
    ///
    /// The encoder runs once per batch, the decoder is re-run on the growing prefix and the
    /// highest scoring token is appended at each step. A sample stops at its first end token.
    pub fn decode(
        &self,
        model: &CaptionModel,
        inputs: &CaptionInputs,
    ) -> Result<Vec<Vec<u32>>> {
        let device = inputs.target.device().clone();
        let b_sz = inputs.target.batch_size();
        let memory = model.encode(inputs, false)?;
        let mut tokens = vec![vec![self.start_token]; b_sz];
        let mut finished = vec![false; b_sz];
        for step in 1..self.max_length {
            let ids: Vec<u32> = tokens.iter().flatten().copied().collect();
            let ids = Tensor::from_vec(ids, (b_sz, step), &device)?;
            let mask = Tensor::zeros((b_sz, step), DType::U8, &device)?;
            let (logits, _) = model.decode(&memory, &ids, &mask, false)?;
            let next = logits.i((.., step - 1, ..))?.argmax(D::Minus1)?;
            let next = next.to_vec1::<u32>()?;
            for (i, token) in next.into_iter().enumerate() {
                if finished[i] {
                    tokens[i].push(self.end_token);
                } else {
                    tokens[i].push(token);
                    finished[i] = token == self.end_token;
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }
        }
        let sequences = tokens
            .into_iter()
            .map(|seq| {
                seq.into_iter()
                    .skip(1)
                    .take_while(|&t| t != self.end_token)
                    .collect()
            })
            .collect();
        Ok(sequences)
    }
}
