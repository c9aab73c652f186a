//! Test fixtures for setting up common test scenarios

use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::training::{Trainer, TrainingConfig};

use super::test_utils::{create_test_config, create_test_device, synthetic_image};

/// Write `per_class` PNGs for each named class into `root/<class>/`
pub fn write_image_folder(root: &Path, classes: &[&str], per_class: usize, size: u32) -> Result<()> {
    for (class, name) in classes.iter().enumerate() {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)?;
        for sample in 0..per_class {
            synthetic_image(class, sample, size).save(dir.join(format!("{:03}.png", sample)))?;
        }
    }
    Ok(())
}

/// Training test fixture: a scratch output directory and a small config
pub struct TrainingTestFixture {
    pub config: TrainingConfig,
    pub temp_dir: TempDir,
    pub output_dir: PathBuf,
}

impl TrainingTestFixture {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let output_dir = temp_dir.path().join("out");

        Ok(Self {
            config: create_test_config(),
            temp_dir,
            output_dir,
        })
    }

    pub fn trainer(&self, run_name: &str) -> Result<Trainer> {
        Trainer::new(self.config.clone(), &self.output_dir, run_name, create_test_device())
    }

    pub fn checkpoint_dir(&self, run_name: &str) -> PathBuf {
        TrainingConfig::checkpoint_dir(&self.output_dir, run_name)
    }
}
