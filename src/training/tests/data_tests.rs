//! Tests for the dataset wrappers and the data loader together

use anyhow::Result;
use std::sync::Arc;

use crate::training::data::{AugmentedDataset, DataLoader, DataLoaderConfig, EvalDataset, SampleSet};

use super::fixtures::write_image_folder;
use super::test_utils::synthetic_sample_set;

fn loader_config(shuffle: bool) -> DataLoaderConfig {
    DataLoaderConfig {
        batch_size: 4,
        shuffle,
        num_workers: 2,
        drop_last: false,
        prefetch_factor: 2,
        seed: 7,
    }
}

#[test]
fn test_augmented_loader_batch_shapes() -> Result<()> {
    let dataset = Arc::new(AugmentedDataset::new(synthetic_sample_set(2, 5, 20), 16));
    let loader = DataLoader::new(dataset, loader_config(true))?;
    assert_eq!(loader.num_batches(), 3);

    let batches = loader.epoch_iter(0).collect::<Result<Vec<_>, _>>()?;
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].images.dims(), &[4, 3, 16, 16]);
    assert_eq!(batches[2].images.dims(), &[2, 3, 16, 16]);

    let mut seen: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_augmentation_is_reproducible_per_epoch() -> Result<()> {
    let dataset = Arc::new(AugmentedDataset::new(synthetic_sample_set(2, 4, 20), 16));
    let loader = DataLoader::new(dataset, loader_config(true))?;

    let first = loader.epoch_iter(3).collect::<Result<Vec<_>, _>>()?;
    let again = loader.epoch_iter(3).collect::<Result<Vec<_>, _>>()?;
    for (a, b) in first.iter().zip(&again) {
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.images.flatten_all()?.to_vec1::<f32>()?, b.images.flatten_all()?.to_vec1::<f32>()?);
    }

    let other: Vec<usize> = loader
        .epoch_iter(4)
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .flat_map(|b| b.indices.clone())
        .collect();
    let order: Vec<usize> = first.iter().flat_map(|b| b.indices.clone()).collect();
    assert_ne!(order, other, "shuffle order should change between epochs");
    Ok(())
}

#[test]
fn test_eval_loader_keeps_order_and_labels() -> Result<()> {
    let samples = synthetic_sample_set(3, 2, 12);
    let expected_labels = samples.labels().to_vec();
    let loader = DataLoader::new(Arc::new(EvalDataset::new(samples, 16)), loader_config(false))?;

    let mut indices = Vec::new();
    let mut labels = Vec::new();
    for batch in loader.epoch_iter(0) {
        let batch = batch?;
        indices.extend(batch.indices.clone());
        labels.extend(batch.labels.to_vec1::<u32>()?);
    }
    assert_eq!(indices, (0..6).collect::<Vec<_>>());
    assert_eq!(labels, expected_labels);
    Ok(())
}

#[test]
fn test_eval_pixels_are_normalized() -> Result<()> {
    let loader = DataLoader::new(
        Arc::new(EvalDataset::new(synthetic_sample_set(1, 2, 16), 16)),
        loader_config(false),
    )?;
    let batch = loader.epoch_iter(0).next().expect("one batch")?;
    let values = batch.images.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    Ok(())
}

#[test]
fn test_folder_to_loader() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    write_image_folder(temp_dir.path(), &["copepod", "diatom"], 3, 24)?;

    let samples = SampleSet::from_folder(temp_dir.path())?;
    assert_eq!(samples.len(), 6);
    assert_eq!(samples.class_counts(), vec![3, 3]);
    assert!(samples.paths()[0].ends_with("copepod/000.png"));

    let loader = DataLoader::new(Arc::new(EvalDataset::new(samples, 16)), loader_config(false))?;
    let total: usize = loader.epoch_iter(0).map(|b| b.map(|b| b.len())).sum::<Result<usize, _>>()?;
    assert_eq!(total, 6);
    Ok(())
}

#[test]
fn test_dropping_iterator_early() -> Result<()> {
    let loader = DataLoader::new(
        Arc::new(AugmentedDataset::new(synthetic_sample_set(2, 10, 16), 16)),
        loader_config(true),
    )?;
    {
        let mut iter = loader.epoch_iter(0);
        assert!(iter.next().is_some());
    }
    assert_eq!(loader.epoch_iter(1).count(), 5);
    Ok(())
}
