use candle::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use refcap_examples::checkpoint::{self, CheckpointMetadata};
use refcap_transformers::models::caption;

fn varmap_with(params: &[(&str, usize, f64)]) -> candle::Result<(VarMap, Vec<Tensor>)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let tensors = params
        .iter()
        .map(|&(name, size, value)| vb.get_with_hints(size, name, Init::Const(value)))
        .collect::<candle::Result<Vec<_>>>()?;
    Ok((varmap, tensors))
}

#[test]
fn metadata_round_trip() -> candle::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ckpt.safetensors");
    let (varmap, _) = varmap_with(&[("mlp.weight", 4, 1.)])?;
    let model = caption::Config {
        use_location_features: true,
        hidden_dim: 64,
        ..Default::default()
    };
    let metadata = CheckpointMetadata {
        epoch: 7,
        train_loss: Some(2.5),
        val_loss: Some(2.75),
        cider: None,
        model: Some(model),
    };
    checkpoint::save(&varmap, &metadata, &path)?;
    assert_eq!(checkpoint::read_metadata(&path)?, metadata);
    Ok(())
}

#[test]
fn strict_load_restores_values() -> candle::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ckpt.safetensors");
    let (saved, _) = varmap_with(&[("a.weight", 3, 2.), ("b.bias", 2, -1.)])?;
    checkpoint::save(&saved, &CheckpointMetadata::default(), &path)?;

    let (fresh, tensors) = varmap_with(&[("a.weight", 3, 0.), ("b.bias", 2, 0.)])?;
    checkpoint::load_strict(&fresh, &path)?;
    assert_eq!(tensors[0].to_vec1::<f32>()?, [2., 2., 2.]);
    assert_eq!(tensors[1].to_vec1::<f32>()?, [-1., -1.]);

    let (extra, _) = varmap_with(&[("a.weight", 3, 0.), ("b.bias", 2, 0.), ("c", 1, 0.)])?;
    assert!(checkpoint::load_strict(&extra, &path).is_err());
    let (fewer, _) = varmap_with(&[("a.weight", 3, 0.)])?;
    assert!(checkpoint::load_strict(&fewer, &path).is_err());
    let (reshaped, _) = varmap_with(&[("a.weight", 4, 0.), ("b.bias", 2, 0.)])?;
    assert!(checkpoint::load_strict(&reshaped, &path).is_err());
    Ok(())
}

#[test]
fn partial_load_reports_differences() -> candle::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ckpt.safetensors");
    let (saved, _) = varmap_with(&[
        ("backbone.w", 3, 1.),
        ("loc_proj.weight", 7, 1.),
        ("old", 1, 1.),
    ])?;
    checkpoint::save(&saved, &CheckpointMetadata::default(), &path)?;

    let (target, tensors) = varmap_with(&[
        ("backbone.w", 3, 0.),
        ("loc_proj.weight", 1, 0.),
        ("transformer.encoder_c.w", 2, 0.),
    ])?;
    let report = checkpoint::load_partial(&target, &path)?;
    assert_eq!(report.loaded, ["backbone.w"]);
    assert_eq!(report.missing, ["loc_proj.weight", "transformer.encoder_c.w"]);
    assert_eq!(report.unexpected, ["old"]);
    assert_eq!(tensors[0].to_vec1::<f32>()?, [1., 1., 1.]);
    assert_eq!(tensors[1].to_vec1::<f32>()?, [0.]);
    Ok(())
}
