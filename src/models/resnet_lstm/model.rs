use super::ResNet;
use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, ModuleT, VarBuilder, LSTM, RNN};

#[derive(Debug, Clone)]
pub struct ResNetLSTMConfig {
    pub widths: Vec<usize>,
    pub blocks_per_stage: usize,
    pub hidden_dim: usize,
    pub dropout: f32,
}

impl Default for ResNetLSTMConfig {
    fn default() -> Self {
        Self {
            widths: vec![64, 128, 256, 512],
            blocks_per_stage: 2,
            hidden_dim: 256,
            dropout: 0.5,
        }
    }
}

/// Per-frame ResNet features fed through an LSTM; the last hidden state is classified.
#[derive(Debug)]
pub struct ResNetLSTM {
    backbone: ResNet,
    lstm: LSTM,
    dropout: Dropout,
    head: Linear,
}

impl ResNetLSTM {
    pub fn new(vb: VarBuilder, cfg: &ResNetLSTMConfig, num_classes: usize) -> Result<Self> {
        let backbone = ResNet::new(vb.pp("backbone"), &cfg.widths, cfg.blocks_per_stage)?;
        let lstm = candle_nn::lstm(
            backbone.out_dim(),
            cfg.hidden_dim,
            candle_nn::LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let head = candle_nn::linear(cfg.hidden_dim, num_classes, vb.pp("head"))?;
        Ok(Self {
            backbone,
            lstm,
            dropout: Dropout::new(cfg.dropout),
            head,
        })
    }
}

impl ModuleT for ResNetLSTM {
    /// `(B, T, 3, H, W)` clips to `(B, num_classes)` logits.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c, h, w) = xs.dims5()?;
        let feats = xs
            .reshape((b * t, c, h, w))?
            .apply_t(&self.backbone, train)?;
        let feats = feats.reshape((b, t, self.backbone.out_dim()))?;
        let states = self.lstm.seq(&feats)?;
        let last = states
            .last()
            .ok_or_else(|| candle_core::Error::Msg("clip has no frames".to_string()))?;
        last.h().apply_t(&self.dropout, train)?.apply(&self.head)
    }
}
