use serde::{ Deserialize, Serialize };
use tch::nn;

use crate::error::{ Error, Result };


pub const SUPPORTED_DEPTHS: [usize; 5] = [18, 34, 50, 101, 152];

const BOTTLENECK_EXPANSION: i64 = 4;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    pub image_shape: [i64; 3],      // (channels, height, width)
    pub num_layers: usize,
    pub out_size: i64,
}


impl ResNetConfig {
    pub fn new(image_shape: [i64; 3], num_layers: usize, out_size: i64) -> Self {
        ResNetConfig { image_shape, num_layers, out_size }
    }

    /// (bottleneck, blocks per stage)
    fn layout(&self) -> Result<(bool, [i64; 4])> {
        match self.num_layers {
            18  => Ok((false, [2, 2, 2, 2])),
            34  => Ok((false, [3, 4, 6, 3])),
            50  => Ok((true, [3, 4, 6, 3])),
            101 => Ok((true, [3, 4, 23, 3])),
            152 => Ok((true, [3, 8, 36, 3])),
            n   => Err(Error::Config(format!(
                "ResNet with {} layers not supported, expected one of {:?}", n, SUPPORTED_DEPTHS
            ))),
        }
    }

    /// Width of the pooled feature vector fed to the classifier.
    pub fn feature_dim(&self) -> Result<i64> {
        let (bottleneck, _) = self.layout()?;
        Ok(if bottleneck { 512 * BOTTLENECK_EXPANSION } else { 512 })
    }

    fn large_input(&self) -> bool {
        self.image_shape[1] > 32
    }

    /// Spatial size of the `layer4` output, before average pooling.
    pub fn feature_map_size(&self) -> [i64; 2] {
        // 3x3/pad 1 and 1x1/pad 0 stride-2 convs both give floor((n - 1) / 2) + 1.
        let halve = |n: i64| (n - 1).div_euclid(2) + 1;
        let halvings = if self.large_input() { 5 } else { 3 };
        let [_, height, width] = self.image_shape;
        let (mut h, mut w) = (height, width);
        for _ in 0..halvings {
            h = halve(h);
            w = halve(w);
        }
        [h, w]
    }

    pub fn validate(&self) -> Result<()> {
        let [channels, height, width] = self.image_shape;
        if channels <= 0 || height <= 0 || width <= 0 {
            return Err(Error::Config(format!("invalid image shape {:?}", self.image_shape)));
        }
        if self.out_size <= 0 {
            return Err(Error::Config(format!("invalid output size {}", self.out_size)));
        }
        self.layout()?;
        // Batch norm cannot train on a single value per channel.
        let [h, w] = self.feature_map_size();
        if h * w < 2 {
            return Err(Error::Config(format!(
                "image size {}x{} is too small, the last stage would shrink it to {}x{}",
                width, height, w, h
            )));
        }
        Ok(())
    }

    pub fn build(&self, vs: &nn::Path) -> Result<nn::FuncT<'static>> {
        self.validate()?;
        let (bottleneck, blocks) = self.layout()?;
        Ok(resnet(vs, self.image_shape[0], self.large_input(), bottleneck, blocks, self.out_size))
    }
}


fn conv2d(
    vs: &nn::Path,
    c_in: i64,
    c_out: i64,
    kernel_size: i64,
    stride: i64,
    padding: i64
    ) -> nn::Conv2D {

    let conv2d_cfg = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(vs, c_in, c_out, kernel_size, conv2d_cfg)
}



fn downsample(
    vs: &nn::Path,
    c_in: i64,
    c_out: i64,
    stride: i64
    ) -> impl nn::ModuleT {

    if stride != 1 || c_in != c_out {
        nn::seq_t()
            .add(conv2d(&(vs / "conv"), c_in, c_out, 1, stride, 0))
            .add(nn::batch_norm2d(&(vs / "bn"), c_out, Default::default()))
    }
    else {
        nn::seq_t()
    }
}



fn basic_block(
    vs: &nn::Path,
    c_in: i64,
    c_out: i64,
    stride: i64
    ) -> impl nn::ModuleT {

    let conv1 = conv2d(&(vs / "conv1"), c_in, c_out, 3, stride, 1);
    let bn1   = nn::batch_norm2d(&(vs / "bn1"), c_out, Default::default());
    let conv2 = conv2d(&(vs / "conv2"), c_out, c_out, 3, 1, 1);
    let bn2   = nn::batch_norm2d(&(vs / "bn2"), c_out, Default::default());
    let downsample = downsample(&(vs / "downsample"), c_in, c_out, stride);

    nn::func_t(move |xs, train| {
        let ys = xs.apply(&conv1)
                   .apply_t(&bn1, train)
                   .relu()
                   .apply(&conv2)
                   .apply_t(&bn2, train);
        (xs.apply_t(&downsample, train) + ys).relu()
    })
}


// 1x1 reduce, 3x3 (carries the stride), 1x1 expand.
fn bottleneck_block(
    vs: &nn::Path,
    c_in: i64,
    c_mid: i64,
    stride: i64
    ) -> impl nn::ModuleT {

    let c_out = c_mid * BOTTLENECK_EXPANSION;
    let conv1 = conv2d(&(vs / "conv1"), c_in, c_mid, 1, 1, 0);
    let bn1   = nn::batch_norm2d(&(vs / "bn1"), c_mid, Default::default());
    let conv2 = conv2d(&(vs / "conv2"), c_mid, c_mid, 3, stride, 1);
    let bn2   = nn::batch_norm2d(&(vs / "bn2"), c_mid, Default::default());
    let conv3 = conv2d(&(vs / "conv3"), c_mid, c_out, 1, 1, 0);
    let bn3   = nn::batch_norm2d(&(vs / "bn3"), c_out, Default::default());
    let downsample = downsample(&(vs / "downsample"), c_in, c_out, stride);

    nn::func_t(move |xs, train| {
        let ys = xs.apply(&conv1)
                   .apply_t(&bn1, train)
                   .relu()
                   .apply(&conv2)
                   .apply_t(&bn2, train)
                   .relu()
                   .apply(&conv3)
                   .apply_t(&bn3, train);
        (xs.apply_t(&downsample, train) + ys).relu()
    })
}


// Returns the stage and its output channel count.
fn stack_residual_blocks(
    vs: &nn::Path,
    c_in: i64,
    c_base: i64,
    stride: i64,
    num_blocks: i64,
    bottleneck: bool,
    ) -> (nn::SequentialT, i64) {

    let mut blocks = nn::seq_t();
    let mut c_in = c_in;
    for idx in 0..num_blocks {
        let stride = if idx == 0 { stride } else { 1 };
        let p = vs / idx;
        if bottleneck {
            blocks = blocks.add(bottleneck_block(&p, c_in, c_base, stride));
            c_in = c_base * BOTTLENECK_EXPANSION;
        }
        else {
            blocks = blocks.add(basic_block(&p, c_in, c_base, stride));
            c_in = c_base;
        }
    }
    (blocks, c_in)
}


fn resnet(
    vs: &nn::Path,
    in_channels: i64,
    large_input: bool,
    bottleneck: bool,
    stage_blocks: [i64; 4],
    num_classes: i64
    ) -> nn::FuncT<'static> {
    // Small images keep full resolution through the stem.
    let (init_conv, pool) = match large_input {
        true  => (conv2d(&(vs / "init_conv"), in_channels, 64, 7, 2, 3), true),
        false => (conv2d(&(vs / "init_conv"), in_channels, 64, 3, 1, 1), false),
    };
    let init_bn = nn::batch_norm2d(&(vs / "init_bn"), 64, Default::default());

    let (block1, c1) = stack_residual_blocks(&(vs / "layer1"), 64, 64, 1, stage_blocks[0], bottleneck);
    let (block2, c2) = stack_residual_blocks(&(vs / "layer2"), c1, 128, 2, stage_blocks[1], bottleneck);
    let (block3, c3) = stack_residual_blocks(&(vs / "layer3"), c2, 256, 2, stage_blocks[2], bottleneck);
    let (block4, c4) = stack_residual_blocks(&(vs / "layer4"), c3, 512, 2, stage_blocks[3], bottleneck);

    let fc = nn::linear(&(vs / "fc"), c4, num_classes, Default::default());

    nn::func_t(move |xs, train| {
        let ys = xs.apply(&init_conv)
                   .apply_t(&init_bn, train)
                   .relu();
        let ys = match pool {
            true  => ys.max_pool2d(&[3, 3], &[2, 2], &[1, 1], &[1, 1], false),
            false => ys,
        };
        ys.apply_t(&block1, train)
          .apply_t(&block2, train)
          .apply_t(&block3, train)
          .apply_t(&block4, train)
          .adaptive_avg_pool2d(&[1, 1])
          .view([-1, c4])
          .apply(&fc)
    })
}



#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::ModuleT;
    use tch::{ Device, Kind, Tensor };

    #[test]
    fn unsupported_depth_is_a_config_error() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResNetConfig::new([3, 32, 32], 42, 10);
        assert!(matches!(cfg.build(&vs.root()), Err(Error::Config(_))));
    }

    #[test]
    fn tiny_images_are_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResNetConfig::new([3, 8, 8], 18, 2);
        assert_eq!(cfg.feature_map_size(), [1, 1]);
        assert!(matches!(cfg.build(&vs.root()), Err(Error::Config(_))));
        assert!(vs.variables().is_empty());

        assert_eq!(ResNetConfig::new([3, 9, 8], 18, 2).feature_map_size(), [2, 1]);
        assert!(ResNetConfig::new([3, 9, 8], 18, 2).validate().is_ok());
        assert_eq!(ResNetConfig::new([3, 33, 33], 50, 2).feature_map_size(), [2, 2]);
        assert_eq!(ResNetConfig::new([3, 224, 224], 50, 40).feature_map_size(), [7, 7]);
    }

    #[test]
    fn resnet18_small_input_gives_class_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = ResNetConfig::new([3, 16, 16], 18, 7).build(&vs.root()).unwrap();
        let xs = Tensor::rand(&[2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let ys = net.forward_t(&xs, false);
        assert_eq!(ys.size(), vec![2, 7]);
    }

    #[test]
    fn resnet50_uses_bottleneck_width() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResNetConfig::new([3, 64, 64], 50, 40);
        assert_eq!(cfg.feature_dim().unwrap(), 2048);
        let net = cfg.build(&vs.root()).unwrap();
        let ys = tch::no_grad(|| net.forward_t(&Tensor::zeros(&[1, 3, 64, 64], (Kind::Float, Device::Cpu)), false));
        assert_eq!(ys.size(), vec![1, 40]);

        let fc_weight = vs.variables().get("fc.weight").map(|t| t.size());
        assert_eq!(fc_weight, Some(vec![40, 2048]));
    }
}
