mod resnet_lstm;
pub use resnet_lstm::{ResNetLSTM, ResNetLSTMConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WhichModel {
    ResnetLstm,
}

impl WhichModel {
    pub fn name(self) -> &'static str {
        match self {
            WhichModel::ResnetLstm => "resnet-lstm",
        }
    }
}

pub fn get_model(
    vb: candle_nn::VarBuilder,
    model: WhichModel,
    num_classes: usize,
) -> candle_core::Result<ResNetLSTM> {
    match model {
        WhichModel::ResnetLstm => {
            ResNetLSTM::new(vb, &ResNetLSTMConfig::default(), num_classes)
        }
    }
}
