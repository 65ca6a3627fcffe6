mod model;
mod resnet;
pub use model::{ResNetLSTM, ResNetLSTMConfig};
pub use resnet::ResNet;
