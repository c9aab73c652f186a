//! Test suite for the plankton training pipeline
//!
//! Unit tests live next to each component; the modules here exercise the
//! components together on small synthetic image sets.

// Test modules
pub mod checkpoint_tests;
pub mod data_tests;

// Utility modules for testing
pub mod fixtures;

pub use fixtures::{write_image_folder, TrainingTestFixture};
pub use test_utils::{create_test_config, create_test_device, synthetic_sample_set};
