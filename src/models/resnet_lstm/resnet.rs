use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

fn conv_bn(
    vb: VarBuilder,
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<(Conv2d, BatchNorm)> {
    let cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    let conv = candle_nn::conv2d_no_bias(c_in, c_out, kernel, cfg, vb.pp("conv"))?;
    let bn = candle_nn::batch_norm(c_out, 1e-5, vb.pp("bn"))?;
    Ok((conv, bn))
}

#[derive(Debug)]
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    pub fn new(vb: VarBuilder, c_in: usize, c_out: usize, stride: usize) -> Result<Self> {
        let (conv1, bn1) = conv_bn(vb.pp("a"), c_in, c_out, 3, stride, 1)?;
        let (conv2, bn2) = conv_bn(vb.pp("b"), c_out, c_out, 3, 1, 1)?;
        let downsample = if stride != 1 || c_in != c_out {
            Some(conv_bn(vb.pp("downsample"), c_in, c_out, 1, stride, 0)?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, train)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, train)?;
        let shortcut = match &self.downsample {
            Some((conv, bn)) => xs.apply(conv)?.apply_t(bn, train)?,
            None => xs.clone(),
        };
        (ys + shortcut)?.relu()
    }
}

/// ResNet-18 style frame encoder: `(N, 3, H, W)` images to `(N, out_dim)` features.
#[derive(Debug)]
pub struct ResNet {
    stem: (Conv2d, BatchNorm),
    blocks: Vec<BasicBlock>,
    out_dim: usize,
}

impl ResNet {
    pub fn new(vb: VarBuilder, widths: &[usize], blocks_per_stage: usize) -> Result<Self> {
        assert!(!widths.is_empty() && blocks_per_stage > 0);
        let stem = conv_bn(vb.pp("stem"), 3, widths[0], 7, 2, 3)?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(widths.len() * blocks_per_stage);
        let mut c_in = widths[0];
        for (stage, &c_out) in widths.iter().enumerate() {
            for j in 0..blocks_per_stage {
                // first stage keeps resolution, later stages halve it once
                let stride = if stage > 0 && j == 0 { 2 } else { 1 };
                let idx = blocks.len();
                blocks.push(BasicBlock::new(
                    vb_blocks.pp(&idx.to_string()),
                    c_in,
                    c_out,
                    stride,
                )?);
                c_in = c_out;
            }
        }

        Ok(Self {
            stem,
            blocks,
            out_dim: c_in,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl ModuleT for ResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (conv, bn) = &self.stem;
        // zero padding is safe for the pool: inputs are post-relu
        let mut xs = xs
            .apply(conv)?
            .apply_t(bn, train)?
            .relu()?
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for block in self.blocks.iter() {
            xs = xs.apply_t(block, train)?;
        }
        xs.mean((2, 3))
    }
}
