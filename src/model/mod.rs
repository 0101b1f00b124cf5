//! Classification networks and the architecture switch used by the CLI.

mod resnet;
mod vit;

pub use resnet::{BasicBlock, ResNet, ResNetConfig};
pub use vit::{VisionTransformer, VitConfig};

use burn::prelude::*;

/// A network mapping `[batch, 3, H, W]` images to `[batch, classes]` logits.
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    ResNet,
    Transformer,
}

impl Architecture {
    /// `resnet` selects the convolutional network; every other name falls
    /// back to the vision transformer.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("resnet") {
            Architecture::ResNet
        } else {
            Architecture::Transformer
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::ResNet => "resnet",
            Architecture::Transformer => "transformer",
        }
    }
}
