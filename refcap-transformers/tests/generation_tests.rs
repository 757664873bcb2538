mod common;

use candle_nn::VarMap;
use common::{images, location, small_config, small_model};
use refcap_transformers::generation::GreedyDecoder;
use refcap_transformers::models::caption::CaptionInputs;
use refcap_transformers::Result;

const START: u32 = 1;
const END: u32 = 2;

#[test]
fn greedy_decoding_is_batched_and_deterministic() -> Result<()> {
    let varmap = VarMap::new();
    let model = small_model(&small_config(true, true), &varmap)?;
    let target = images(&[(32, 32), (16, 40), (24, 24)], 0.)?;
    let global = images(&[(48, 48), (48, 48), (40, 56)], 1.)?;
    let loc = location(3, 7)?;
    let inputs = CaptionInputs::new(&target)
        .with_global(&global)
        .with_location(&loc);

    let decoder = GreedyDecoder::new(START, END, 10);
    let first = decoder.decode(&model, &inputs)?;
    let second = decoder.decode(&model, &inputs)?;
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    for seq in first.iter() {
        assert!(seq.len() <= 9);
        assert!(!seq.contains(&END));
        assert!(seq.iter().all(|&t| (t as usize) < 50));
    }
    Ok(())
}

#[test]
fn batched_decoding_matches_single_samples() -> Result<()> {
    let varmap = VarMap::new();
    let model = small_model(&small_config(false, false), &varmap)?;
    let decoder = GreedyDecoder::new(START, END, 8);
    let batch = images(&[(32, 32), (32, 32)], 0.)?;
    let batched = decoder.decode(&model, &CaptionInputs::new(&batch))?;
    // Same pixels as the first sample of the batch.
    let single = images(&[(32, 32)], 0.)?;
    let single = decoder.decode(&model, &CaptionInputs::new(&single))?;
    assert_eq!(batched[0], single[0]);
    Ok(())
}

#[test]
fn no_steps_yield_empty_captions() -> Result<()> {
    let varmap = VarMap::new();
    let model = small_model(&small_config(false, true), &varmap)?;
    let target = images(&[(32, 32), (32, 32)], 0.)?;
    let loc = location(2, 7)?;
    let inputs = CaptionInputs::new(&target).with_location(&loc);
    let captions = GreedyDecoder::new(START, END, 1).decode(&model, &inputs)?;
    assert_eq!(captions, vec![Vec::<u32>::new(), Vec::new()]);
    Ok(())
}
