//! Trainable classification head: optional dropout then one linear layer.

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{activation::softmax, backend::Backend, Tensor},
};

/// Configuration for the classification head
#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    /// Width of the incoming embedding
    pub feature_dim: usize,

    #[config(default = "2")]
    pub num_classes: usize,

    /// Dropout applied to the embedding during training
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl ClassifierHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            dropout: DropoutConfig::new(self.dropout).init(),
            linear: LinearConfig::new(self.feature_dim, self.num_classes).init(device),
            feature_dim: self.feature_dim,
            num_classes: self.num_classes,
        }
    }
}

#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub dropout: Dropout,
    pub linear: Linear<B>,
    feature_dim: usize,
    num_classes: usize,
}

impl<B: Backend> ClassifierHead<B> {
    /// `[batch, feature_dim]` -> logits `[batch, num_classes]`
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(features);
        self.linear.forward(x)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(features), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}
