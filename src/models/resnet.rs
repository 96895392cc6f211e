use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct ResnetBlock3DConfig {
    /// Output channels, defaulting to the input channel count.
    pub out_channels: Option<i64>,
    /// Dimension of the timestep embedding added after the first convolution,
    /// none to run the block without timestep conditioning.
    pub temb_channels: Option<i64>,
    pub groups: i64,
    pub eps: f64,
    // non_linearity: silu
}

impl Default for ResnetBlock3DConfig {
    fn default() -> Self {
        Self { out_channels: None, temb_channels: Some(512), groups: 32, eps: 1e-5 }
    }
}

#[derive(Debug)]
pub struct ResnetBlock3D {
    norm1: nn::GroupNorm,
    conv1: nn::Conv3D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv3D,
    time_emb_proj: Option<nn::Linear>,
    conv_shortcut: Option<nn::Conv3D>,
}

impl ResnetBlock3D {
    pub fn new(vs: nn::Path, in_channels: i64, config: ResnetBlock3DConfig) -> Self {
        let out_channels = config.out_channels.unwrap_or(in_channels);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", config.groups, in_channels, group_cfg);
        let conv1 = nn::conv3d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::group_norm(&vs / "norm2", config.groups, out_channels, group_cfg);
        let conv2 = nn::conv3d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let conv_shortcut = if in_channels != out_channels {
            let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
            Some(nn::conv3d(&vs / "conv_shortcut", in_channels, out_channels, 1, conv_cfg))
        } else {
            None
        };
        let time_emb_proj = config.temb_channels.map(|temb_channels| {
            nn::linear(&vs / "time_emb_proj", temb_channels, out_channels, Default::default())
        });
        Self { norm1, conv1, norm2, conv2, time_emb_proj, conv_shortcut }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Tensor {
        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => xs.apply(conv_shortcut),
            None => xs.shallow_clone(),
        };
        let xs = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let xs = match (temb, &self.time_emb_proj) {
            (Some(temb), Some(time_emb_proj)) => {
                // broadcast the embedding over the three spatial dimensions
                temb.silu().apply(time_emb_proj).unsqueeze(-1).unsqueeze(-1).unsqueeze(-1) + xs
            }
            _ => xs,
        };
        let xs = xs.apply(&self.norm2).silu().apply(&self.conv2);
        shortcut_xs + xs
    }
}
