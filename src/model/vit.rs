//! Vision transformer classifier (DeiT/ViT layout)
//!
//! Wraps the `candle-transformers` ViT so parameter names follow the Hugging
//! Face `ViTForImageClassification` layout (`vit.*`, `classifier.*`), which
//! lets DeiT/ViT hub checkpoints load by name.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::vit;
use serde::{Deserialize, Serialize};

use super::ImageClassifier;
use crate::error::{Error, Result};

/// Transformer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub qkv_bias: bool,
}

impl VitConfig {
    /// DeiT-B/16, the same shape as ViT-B/16
    pub fn deit_base_patch16() -> Self {
        Self {
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            patch_size: 16,
            layer_norm_eps: 1e-12,
            qkv_bias: true,
        }
    }

    /// Check the transformer shape against an input resolution
    pub fn validate(&self, image_size: usize) -> Result<()> {
        if self.patch_size == 0 || image_size % self.patch_size != 0 {
            return Err(Error::config(format!(
                "image_size {} is not divisible by patch_size {}",
                image_size, self.patch_size
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    fn to_candle(&self, image_size: usize) -> vit::Config {
        vit::Config {
            hidden_size: self.hidden_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            intermediate_size: self.intermediate_size,
            layer_norm_eps: self.layer_norm_eps,
            image_size,
            patch_size: self.patch_size,
            num_channels: 3,
            qkv_bias: self.qkv_bias,
            ..vit::Config::vit_base_patch16_224()
        }
    }
}

/// ViT with a linear head on the CLS token
pub struct VitClassifier {
    model: vit::Model,
    num_classes: usize,
}

impl VitClassifier {
    pub fn new(config: &VitConfig, image_size: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        config.validate(image_size)?;
        let model = vit::Model::new(&config.to_candle(image_size), num_classes, vb)?;
        Ok(Self { model, num_classes })
    }
}

impl ImageClassifier for VitClassifier {
    fn forward(&self, images: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        self.model.forward(images)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn name(&self) -> &str {
        "vit"
    }
}
