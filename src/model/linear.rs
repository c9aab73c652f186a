//! Linear baseline over flattened pixels

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use super::ImageClassifier;
use crate::error::Result;

pub struct LinearClassifier {
    head: Linear,
    num_classes: usize,
}

impl LinearClassifier {
    pub fn new(image_size: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let head = candle_nn::linear(3 * image_size * image_size, num_classes, vb.pp("classifier"))?;
        Ok(Self { head, num_classes })
    }
}

impl ImageClassifier for LinearClassifier {
    fn forward(&self, images: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        self.head.forward(&images.flatten_from(1)?)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn name(&self) -> &str {
        "linear"
    }
}
