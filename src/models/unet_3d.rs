//! 3D UNet Denoising Models
//!
//! The 3D UNet model takes a noisy volume and the current diffusion
//! timestep as input and predicts the noise contained in the volume. It is
//! unconditional: there is no text or label guidance, only the timestep
//! embedding.
use crate::models::embeddings::{TimestepEmbedding, Timesteps};
use crate::models::unet_3d_blocks::*;
use crate::models::NoisePredictor;
use tch::{nn, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub out_channels: i64,
    pub use_attn: bool,
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone)]
pub struct UNet3DModelConfig {
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: i64,
    pub norm_num_groups: i64,
    pub norm_eps: f64,
}

impl Default for UNet3DModelConfig {
    fn default() -> Self {
        Self {
            blocks: vec![
                BlockConfig { out_channels: 32, use_attn: false, attention_head_dim: 8 },
                BlockConfig { out_channels: 64, use_attn: false, attention_head_dim: 8 },
                BlockConfig { out_channels: 64, use_attn: true, attention_head_dim: 8 },
            ],
            layers_per_block: 2,
            norm_num_groups: 32,
            norm_eps: 1e-5,
        }
    }
}

#[derive(Debug)]
enum UNetDownBlock {
    Basic(DownBlock3D),
    Attn(AttnDownBlock3D),
}

#[derive(Debug)]
enum UNetUpBlock {
    Basic(UpBlock3D),
    Attn(AttnUpBlock3D),
}

#[derive(Debug)]
pub struct UNet3DModel {
    conv_in: nn::Conv3D,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock3D,
    up_blocks: Vec<UNetUpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv3D,
    config: UNet3DModelConfig,
}

impl UNet3DModel {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        config: UNet3DModelConfig,
    ) -> Self {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks.last().unwrap().out_channels;
        let bl_attention_head_dim = config.blocks.last().unwrap().attention_head_dim;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv3d(&vs / "conv_in", in_channels, b_channels, 3, conv_cfg);

        let time_proj = Timesteps::new(b_channels, vs.device());
        let time_embedding =
            TimestepEmbedding::new(&vs / "time_embedding", b_channels, time_embed_dim);

        let vs_db = &vs / "down_blocks";
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig { out_channels, use_attn, attention_head_dim } = config.blocks[i];
                let in_channels =
                    if i > 0 { config.blocks[i - 1].out_channels } else { b_channels };
                let db_cfg = DownBlock3DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                };
                if use_attn {
                    let config = AttnDownBlock3DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                    };
                    let block = AttnDownBlock3D::new(
                        &vs_db / i,
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        config,
                    );
                    UNetDownBlock::Attn(block)
                } else {
                    let block = DownBlock3D::new(
                        &vs_db / i,
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    );
                    UNetDownBlock::Basic(block)
                }
            })
            .collect();

        let mid_cfg = UNetMidBlock3DConfig {
            resnet_eps: config.norm_eps,
            attn_num_head_channels: Some(bl_attention_head_dim),
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block =
            UNetMidBlock3D::new(&vs / "mid_block", bl_channels, Some(time_embed_dim), mid_cfg);

        let vs_ub = &vs / "up_blocks";
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig { out_channels, use_attn, attention_head_dim } =
                    config.blocks[n_blocks - 1 - i];
                let prev_out_channels =
                    if i > 0 { config.blocks[n_blocks - i].out_channels } else { bl_channels };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.blocks[index].out_channels
                };
                let ub_cfg = UpBlock3DConfig {
                    num_layers: config.layers_per_block + 1,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_upsample: i < n_blocks - 1,
                };
                if use_attn {
                    let config = AttnUpBlock3DConfig {
                        upblock: ub_cfg,
                        attn_num_head_channels: attention_head_dim,
                    };
                    let block = AttnUpBlock3D::new(
                        &vs_ub / i,
                        in_channels,
                        prev_out_channels,
                        out_channels,
                        Some(time_embed_dim),
                        config,
                    );
                    UNetUpBlock::Attn(block)
                } else {
                    let block = UpBlock3D::new(
                        &vs_ub / i,
                        in_channels,
                        prev_out_channels,
                        out_channels,
                        Some(time_embed_dim),
                        ub_cfg,
                    );
                    UNetUpBlock::Basic(block)
                }
            })
            .collect();

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, b_channels, group_cfg);
        let conv_out = nn::conv3d(&vs / "conv_out", b_channels, out_channels, 3, conv_cfg);
        Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        }
    }

    /// Predicts the noise contained in `xs` at the diffusion timesteps given
    /// as a float tensor with one entry per batch element.
    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let (_bsize, _channels, depth, height, width) = crate::utils::dims5(xs);
        let n_blocks = self.config.blocks.len();
        let num_upsamplers = n_blocks - 1;
        let default_overall_up_factor = 2i64.pow(num_upsamplers as u32);
        let forward_upsample_size = depth % default_overall_up_factor != 0
            || height % default_overall_up_factor != 0
            || width % default_overall_up_factor != 0;
        // 1. time
        let emb = timesteps
            .to_kind(Kind::Float)
            .apply(&self.time_proj)
            .apply(&self.time_embedding);
        // 2. pre-process
        let xs = xs.apply(&self.conv_in);
        // 3. down
        let mut down_block_res_xs = vec![xs.shallow_clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (_xs, res_xs) = match down_block {
                UNetDownBlock::Basic(b) => b.forward(&xs, Some(&emb)),
                UNetDownBlock::Attn(b) => b.forward(&xs, Some(&emb)),
            };
            down_block_res_xs.extend(res_xs);
            xs = _xs;
        }
        // 4. mid
        let xs = self.mid_block.forward(&xs, Some(&emb));
        // 5. up
        let mut xs = xs;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let n_resnets = match up_block {
                UNetUpBlock::Basic(b) => b.resnets.len(),
                UNetUpBlock::Attn(b) => b.num_resnets(),
            };
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - n_resnets);
            if i < n_blocks - 1 && forward_upsample_size {
                let (_, _, d, h, w) = crate::utils::dims5(down_block_res_xs.last().unwrap());
                upsample_size = Some((d, h, w))
            }
            xs = match up_block {
                UNetUpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size),
                UNetUpBlock::Attn(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size),
            };
        }
        // 6. post-process
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}

impl NoisePredictor for UNet3DModel {
    fn predict_noise(&self, sample: &Tensor, timestep: usize) -> Tensor {
        let bsize = sample.size()[0];
        let timesteps = Tensor::ones([bsize], (Kind::Float, sample.device())) * timestep as f64;
        self.forward(sample, &timesteps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn tiny_config() -> UNet3DModelConfig {
        UNet3DModelConfig {
            blocks: vec![
                BlockConfig { out_channels: 8, use_attn: false, attention_head_dim: 4 },
                BlockConfig { out_channels: 16, use_attn: true, attention_head_dim: 4 },
            ],
            layers_per_block: 1,
            norm_num_groups: 4,
            norm_eps: 1e-5,
        }
    }

    #[test]
    fn output_shape_matches_input_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = UNet3DModel::new(vs.root(), 1, 1, tiny_config());
        let xs = Tensor::randn([2, 1, 8, 8, 8], (Kind::Float, Device::Cpu));
        let timesteps = Tensor::from_slice(&[3f32, 7f32]);
        let out = unet.forward(&xs, &timesteps);
        assert_eq!(out.size(), vec![2, 1, 8, 8, 8]);
    }

    #[test]
    fn predict_noise_broadcasts_the_timestep() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = UNet3DModel::new(vs.root(), 1, 1, tiny_config());
        let xs = Tensor::randn([1, 1, 8, 8, 8], (Kind::Float, Device::Cpu));
        let out = unet.predict_noise(&xs, 5);
        assert_eq!(out.size(), xs.size());
    }
}
