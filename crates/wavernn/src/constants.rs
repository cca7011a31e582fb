//! Model and signal-processing constants.

// Reference configuration of the trained vocoder.
pub const SAMPLE_RATE_HZ: u32 = 22_050;
pub const FEAT_DIMS: usize = 80;
pub const RNN_DIMS: usize = 512;
pub const FC_DIMS: usize = 512;
pub const BITS: u32 = 9;
pub const PAD: usize = 2;
pub const UPSAMPLE_FACTORS: [usize; 3] = [5, 5, 11]; // 275 samples per frame
pub const COMPUTE_DIMS: usize = 128;
pub const RES_OUT_DIMS: usize = 128;
pub const RES_BLOCKS: usize = 10;

// Conditioning network layout.
pub const RESNET_KERNEL: usize = 5;
/// Frames lost at each end by the unpadded input conv of the residual stack.
pub const RESNET_CONTEXT: usize = RESNET_KERNEL / 2;
pub const AUX_SLICES: usize = 4;
pub const BATCH_NORM_EPS: f32 = 1e-5;

// Generation loop.
pub const PROGRESS_INTERVAL: usize = 1000;
