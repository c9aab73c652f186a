//! Tests for reloading trained checkpoints

use anyhow::Result;
use candle_core::Tensor;

use crate::model::{ModelArchitecture, ModelConfig};
use crate::training::{AdamWOptimizer, CheckpointManager, CheckpointMetadata, Optimizer};

use super::fixtures::TrainingTestFixture;
use super::test_utils::{create_test_device, synthetic_sample_set};

#[test]
fn test_reload_reproduces_predictions() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let device = create_test_device();
    let result = fixture.trainer("Init_0")?.run(synthetic_sample_set(2, 10, 20))?;
    let manager = CheckpointManager::open(fixture.checkpoint_dir("Init_0"))?;

    let input = Tensor::rand(0f32, 1f32, (3, 3, 16, 16), &device)?;

    let (first_map, first) = fixture.config.model.build(result.classes.len(), &device)?;
    manager.load(&first_map, None, &device)?;
    let (second_map, second) = fixture.config.model.build(result.classes.len(), &device)?;
    manager.load(&second_map, None, &device)?;

    let a = first.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;
    let b = second.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_optimizer_state_survives_reload() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let device = create_test_device();
    let result = fixture.trainer("Init_0")?.run(synthetic_sample_set(2, 10, 20))?;
    let manager = CheckpointManager::open(fixture.checkpoint_dir("Init_0"))?;

    let (var_map, _model) = fixture.config.model.build(result.classes.len(), &device)?;
    let mut optimizer = AdamWOptimizer::from_config(&var_map, &fixture.config.optimizer)?;
    let metadata = manager.load(&var_map, Some(&mut optimizer), &device)?;

    assert_eq!(optimizer.step_count(), metadata.global_step);
    assert!(optimizer.step_count() > 0);
    assert_eq!(optimizer.learning_rate(), metadata.learning_rate);
    Ok(())
}

#[test]
fn test_reload_rejects_other_architecture() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let device = create_test_device();
    let result = fixture.trainer("Init_0")?.run(synthetic_sample_set(2, 10, 20))?;
    let manager = CheckpointManager::open(fixture.checkpoint_dir("Init_0"))?;

    // Same architecture, different input size: the classifier weight no longer fits
    let other = ModelConfig {
        architecture: ModelArchitecture::Linear,
        image_size: 8,
        pretrained: None,
    };
    let (var_map, _model) = other.build(result.classes.len(), &device)?;
    assert!(manager.load(&var_map, None, &device).is_err());
    Ok(())
}

#[test]
fn test_metadata_round_trip() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let device = create_test_device();
    let manager = CheckpointManager::new(temp_dir.path().join("trained_models"))?;
    assert!(!manager.exists());

    let (var_map, model) = ModelConfig {
        architecture: ModelArchitecture::Linear,
        image_size: 8,
        pretrained: None,
    }
    .build(3, &device)?;

    let metadata = CheckpointMetadata {
        val_f1: 0.75,
        val_accuracy: 0.8,
        learning_rate: 1e-3,
        ..CheckpointMetadata::new(4, vec!["a".into(), "b".into(), "c".into()], model.name())
    };
    manager.save(&var_map, None, &metadata)?;
    assert!(manager.exists());

    let loaded = manager.load_metadata()?;
    assert_eq!(loaded.epoch, 4);
    assert_eq!(loaded.val_f1, 0.75);
    assert_eq!(loaded.classes.len(), 3);
    Ok(())
}
