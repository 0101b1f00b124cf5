use burn::module::Param;
use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
    Dropout, DropoutConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
};
use burn::prelude::*;

use super::ImageClassifier;
use crate::error::{Error, Result};

/// Vision transformer classifying from a learned class token.
///
/// Defaults: 32x32 inputs cut into 16x16 patches, 512-wide embeddings, two
/// pre-norm encoder layers with 8 heads of 64 dims and a 1024-wide MLP.
#[derive(Config, Debug)]
pub struct VitConfig {
    #[config(default = 32)]
    pub image_size: usize,
    #[config(default = 16)]
    pub patch_size: usize,
    #[config(default = 100)]
    pub num_classes: usize,
    #[config(default = 512)]
    pub dim: usize,
    #[config(default = 2)]
    pub depth: usize,
    #[config(default = 8)]
    pub heads: usize,
    #[config(default = 1024)]
    pub mlp_dim: usize,
    #[config(default = 64)]
    pub dim_head: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub emb_dropout: f64,
}

impl VitConfig {
    pub fn num_patches(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side
    }

    fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(Error::InvalidModel(format!(
                "image size {} is not divisible by patch size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.heads * self.dim_head != self.dim {
            return Err(Error::InvalidModel(format!(
                "{} heads of {} dims do not cover an embedding of {}",
                self.heads, self.dim_head, self.dim
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VisionTransformer<B>> {
        self.validate()?;

        let patch = [self.patch_size, self.patch_size];
        let embedding = Initializer::Normal {
            mean: 0.0,
            std: 1.0,
        };

        Ok(VisionTransformer {
            patch_embedding: Conv2dConfig::new([self.channels, self.dim], patch)
                .with_stride(patch)
                .init(device),
            cls_token: embedding.init([1, 1, self.dim], device),
            pos_embedding: embedding.init([1, self.num_patches() + 1, self.dim], device),
            dropout: DropoutConfig::new(self.emb_dropout).init(),
            encoder: TransformerEncoderConfig::new(self.dim, self.mlp_dim, self.heads, self.depth)
                .with_dropout(self.dropout)
                .with_norm_first(true)
                .init(device),
            norm: LayerNormConfig::new(self.dim).init(device),
            head: LinearConfig::new(self.dim, self.num_classes).init(device),
        })
    }
}

#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embedding: Conv2d<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embedding: Param<Tensor<B, 3>>,
    dropout: Dropout,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    head: Linear<B>,
}

impl<B: Backend> ImageClassifier<B> for VisionTransformer<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // [B, C, H, W] -> [B, dim, H/p, W/p] -> [B, patches, dim]
        let x = self.patch_embedding.forward(images);
        let [batch_size, dim, height, width] = x.dims();
        let x = x.reshape([batch_size, dim, height * width]).swap_dims(1, 2);

        let cls = self.cls_token.val().expand([batch_size, 1, dim]);
        let x = Tensor::cat(vec![cls, x], 1) + self.pos_embedding.val();
        let x = self.dropout.forward(x);

        let x = self.encoder.forward(TransformerEncoderInput::new(x));
        let x = self.norm.forward(x);

        let cls = x.slice([0..batch_size, 0..1, 0..dim]).reshape([batch_size, dim]);
        self.head.forward(cls)
    }
}
