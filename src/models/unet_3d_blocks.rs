//! 3D UNet Building Blocks
//!
use crate::models::attention::{AttentionBlock, AttentionBlockConfig};
use crate::models::resnet::{ResnetBlock3D, ResnetBlock3DConfig};
use tch::{nn, nn::Module, Tensor};

#[derive(Debug)]
struct Downsample3D {
    conv: nn::Conv3D,
}

impl Downsample3D {
    fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let config = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv3d(&vs / "conv", in_channels, out_channels, 3, config);
        Downsample3D { conv }
    }
}

impl Module for Downsample3D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

// This does not support the conv-transpose mode.
#[derive(Debug)]
struct Upsample3D {
    conv: nn::Conv3D,
}

impl Upsample3D {
    fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let config = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv = nn::conv3d(&vs / "conv", in_channels, out_channels, 3, config);
        Self { conv }
    }
}

impl Upsample3D {
    fn forward(&self, xs: &Tensor, size: Option<(i64, i64, i64)>) -> Tensor {
        let xs = match size {
            None => {
                let (_bsize, _channels, d, h, w) = crate::utils::dims5(xs);
                xs.upsample_nearest3d([2 * d, 2 * h, 2 * w], Some(2.), Some(2.), Some(2.))
            }
            Some((d, h, w)) => xs.upsample_nearest3d([d, h, w], None, None, None),
        };
        xs.apply(&self.conv)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownBlock3DConfig {
    pub num_layers: i64,
    pub resnet_eps: f64,
    // resnet_act_fn: "swish"
    pub resnet_groups: i64,
    pub add_downsample: bool,
}

impl Default for DownBlock3DConfig {
    fn default() -> Self {
        Self { num_layers: 1, resnet_eps: 1e-5, resnet_groups: 32, add_downsample: true }
    }
}

#[derive(Debug)]
pub struct DownBlock3D {
    resnets: Vec<ResnetBlock3D>,
    downsampler: Option<Downsample3D>,
    pub config: DownBlock3DConfig,
}

impl DownBlock3D {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        config: DownBlock3DConfig,
    ) -> Self {
        let vs_resnets = &vs / "resnets";
        let resnet_cfg = ResnetBlock3DConfig {
            out_channels: Some(out_channels),
            eps: config.resnet_eps,
            groups: config.resnet_groups,
            temb_channels,
        };
        let resnets = (0..config.num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                ResnetBlock3D::new(&vs_resnets / i, in_channels, resnet_cfg)
            })
            .collect();
        let downsampler = if config.add_downsample {
            Some(Downsample3D::new(&vs / "downsamplers" / 0, out_channels, out_channels))
        } else {
            None
        };
        Self { resnets, downsampler, config }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> (Tensor, Vec<Tensor>) {
        let mut xs = xs.shallow_clone();
        let mut output_states = vec![];
        for resnet in self.resnets.iter() {
            xs = resnet.forward(&xs, temb);
            output_states.push(xs.shallow_clone());
        }
        let xs = match &self.downsampler {
            Some(downsampler) => {
                let xs = xs.apply(downsampler);
                output_states.push(xs.shallow_clone());
                xs
            }
            None => xs,
        };
        (xs, output_states)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttnDownBlock3DConfig {
    pub downblock: DownBlock3DConfig,
    pub attn_num_head_channels: i64,
}

impl Default for AttnDownBlock3DConfig {
    fn default() -> Self {
        Self { downblock: Default::default(), attn_num_head_channels: 1 }
    }
}

#[derive(Debug)]
pub struct AttnDownBlock3D {
    downblock: DownBlock3D,
    attentions: Vec<AttentionBlock>,
    pub config: AttnDownBlock3DConfig,
}

impl AttnDownBlock3D {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        config: AttnDownBlock3DConfig,
    ) -> Self {
        let downblock =
            DownBlock3D::new(vs.clone(), in_channels, out_channels, temb_channels, config.downblock);
        let attn_cfg = AttentionBlockConfig {
            num_head_channels: Some(config.attn_num_head_channels),
            num_groups: config.downblock.resnet_groups,
            eps: config.downblock.resnet_eps,
        };
        let vs_attn = &vs / "attentions";
        let attentions = (0..config.downblock.num_layers)
            .map(|i| AttentionBlock::new(&vs_attn / i, out_channels, attn_cfg))
            .collect();
        Self { downblock, attentions, config }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> (Tensor, Vec<Tensor>) {
        let mut output_states = vec![];
        let mut xs = xs.shallow_clone();
        for (resnet, attn) in self.downblock.resnets.iter().zip(self.attentions.iter()) {
            xs = resnet.forward(&xs, temb);
            xs = xs.apply(attn);
            output_states.push(xs.shallow_clone());
        }
        let xs = match &self.downblock.downsampler {
            Some(downsampler) => {
                let xs = xs.apply(downsampler);
                output_states.push(xs.shallow_clone());
                xs
            }
            None => xs,
        };
        (xs, output_states)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UNetMidBlock3DConfig {
    pub num_layers: i64,
    pub resnet_eps: f64,
    pub resnet_groups: Option<i64>,
    pub attn_num_head_channels: Option<i64>,
    // attention_type "default"
}

impl Default for UNetMidBlock3DConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            resnet_eps: 1e-5,
            resnet_groups: Some(32),
            attn_num_head_channels: Some(1),
        }
    }
}

#[derive(Debug)]
pub struct UNetMidBlock3D {
    resnet: ResnetBlock3D,
    attn_resnets: Vec<(AttentionBlock, ResnetBlock3D)>,
    pub config: UNetMidBlock3DConfig,
}

impl UNetMidBlock3D {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        temb_channels: Option<i64>,
        config: UNetMidBlock3DConfig,
    ) -> Self {
        let vs_resnets = &vs / "resnets";
        let vs_attns = &vs / "attentions";
        let resnet_groups = config.resnet_groups.unwrap_or_else(|| i64::min(in_channels / 4, 32));
        let resnet_cfg = ResnetBlock3DConfig {
            eps: config.resnet_eps,
            groups: resnet_groups,
            temb_channels,
            ..Default::default()
        };
        let resnet = ResnetBlock3D::new(&vs_resnets / "0", in_channels, resnet_cfg);
        let attn_cfg = AttentionBlockConfig {
            num_head_channels: config.attn_num_head_channels,
            num_groups: resnet_groups,
            eps: config.resnet_eps,
        };
        let mut attn_resnets = vec![];
        for index in 0..config.num_layers {
            let attn = AttentionBlock::new(&vs_attns / index, in_channels, attn_cfg);
            let resnet = ResnetBlock3D::new(&vs_resnets / (index + 1), in_channels, resnet_cfg);
            attn_resnets.push((attn, resnet))
        }
        Self { resnet, attn_resnets, config }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Tensor {
        let mut xs = self.resnet.forward(xs, temb);
        for (attn, resnet) in self.attn_resnets.iter() {
            xs = resnet.forward(&xs.apply(attn), temb)
        }
        xs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpBlock3DConfig {
    pub num_layers: i64,
    pub resnet_eps: f64,
    // resnet_act_fn: "swish"
    pub resnet_groups: i64,
    pub add_upsample: bool,
}

impl Default for UpBlock3DConfig {
    fn default() -> Self {
        Self { num_layers: 1, resnet_eps: 1e-5, resnet_groups: 32, add_upsample: true }
    }
}

#[derive(Debug)]
pub struct UpBlock3D {
    pub resnets: Vec<ResnetBlock3D>,
    upsampler: Option<Upsample3D>,
    pub config: UpBlock3DConfig,
}

impl UpBlock3D {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        prev_output_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        config: UpBlock3DConfig,
    ) -> Self {
        let vs_resnets = &vs / "resnets";
        let resnet_cfg = ResnetBlock3DConfig {
            out_channels: Some(out_channels),
            temb_channels,
            eps: config.resnet_eps,
            groups: config.resnet_groups,
        };
        let resnets: Vec<_> = (0..config.num_layers)
            .map(|i| {
                let res_skip_channels =
                    if i == config.num_layers - 1 { in_channels } else { out_channels };
                let resnet_in_channels = if i == 0 { prev_output_channels } else { out_channels };
                let in_channels = resnet_in_channels + res_skip_channels;
                ResnetBlock3D::new(&vs_resnets / i, in_channels, resnet_cfg)
            })
            .collect();
        let upsampler = if config.add_upsample {
            Some(Upsample3D::new(&vs / "upsamplers" / 0, out_channels, out_channels))
        } else {
            None
        };
        Self { resnets, upsampler, config }
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: Option<&Tensor>,
        upsample_size: Option<(i64, i64, i64)>,
    ) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (index, resnet) in self.resnets.iter().enumerate() {
            xs = Tensor::cat(&[&xs, &res_xs[res_xs.len() - index - 1]], 1);
            xs = resnet.forward(&xs, temb);
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => xs,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttnUpBlock3DConfig {
    pub upblock: UpBlock3DConfig,
    pub attn_num_head_channels: i64,
}

impl Default for AttnUpBlock3DConfig {
    fn default() -> Self {
        Self { upblock: Default::default(), attn_num_head_channels: 1 }
    }
}

#[derive(Debug)]
pub struct AttnUpBlock3D {
    upblock: UpBlock3D,
    attentions: Vec<AttentionBlock>,
    pub config: AttnUpBlock3DConfig,
}

impl AttnUpBlock3D {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        prev_output_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        config: AttnUpBlock3DConfig,
    ) -> Self {
        let upblock = UpBlock3D::new(
            vs.clone(),
            in_channels,
            prev_output_channels,
            out_channels,
            temb_channels,
            config.upblock,
        );
        let attn_cfg = AttentionBlockConfig {
            num_head_channels: Some(config.attn_num_head_channels),
            num_groups: config.upblock.resnet_groups,
            eps: config.upblock.resnet_eps,
        };
        let vs_attn = &vs / "attentions";
        let attentions = (0..config.upblock.num_layers)
            .map(|i| AttentionBlock::new(&vs_attn / i, out_channels, attn_cfg))
            .collect();
        Self { upblock, attentions, config }
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: Option<&Tensor>,
        upsample_size: Option<(i64, i64, i64)>,
    ) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (index, resnet) in self.upblock.resnets.iter().enumerate() {
            xs = Tensor::cat(&[&xs, &res_xs[res_xs.len() - index - 1]], 1);
            xs = resnet.forward(&xs, temb);
            xs = xs.apply(&self.attentions[index]);
        }
        match &self.upblock.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => xs,
        }
    }

    pub fn num_resnets(&self) -> usize {
        self.upblock.resnets.len()
    }
}
