use std::path::PathBuf;

use ndarray::{Array2, Array3, Array4, ArrayView3};

use crate::adapters::{AdapterDelta, AdapterWeights, BaseWeights, EffectiveModel};
use crate::job::Conditioning;
use crate::registry::{AdapterSource, ResolvedModel};
use crate::stepcache::Branch;

/// Latent tensor for one window, laid out `(channels, frames, height, width)`.
pub type LatentState = Array4<f32>;

/// Decoded pixels for one window, laid out `(frames, channels, height, width)`.
pub type VideoClip = Array4<f32>;

/// One window's worth of work handed to a backend.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    pub window_index: usize,
    /// Global index of this window's first frame in the full clip.
    pub start_frame: usize,
    pub frame_count: usize,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub prompt: String,
    pub negative_prompt: String,
    /// Re-encoded tail of the previous window, used as conditioning so
    /// motion continues across the seam. Same layout as [`LatentState`].
    pub overlap_latents: Option<LatentState>,
    /// Job-level image/video references; which of them apply is up to
    /// the architecture.
    pub references: Conditioning,
    /// Frames forced into this window, keyed by window-local index.
    pub injected: Vec<(usize, PathBuf)>,
}

#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub step_index: usize,
    pub total_steps: usize,
    pub guidance: f32,
    pub branch: Branch,
}

/// Denoising backend for one model architecture. Implementations hold
/// their composed weights; the generator drives the step loop, guidance
/// combination, and caching, so backends only produce per-branch
/// residuals.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Longest clip the underlying model was trained to produce in one
    /// pass. Requests beyond this must be split into windows.
    fn max_native_frames(&self) -> usize;

    /// Whether this backend re-denoises the conditioning overlap frames
    /// (their output then participates in cross-fade blending) or emits
    /// only frames past the overlap.
    fn regenerates_overlap(&self) -> bool;

    /// Read the adapter-targetable base weight tensors for a resolved
    /// model. Runs on the CPU preprocessing lane, before composition.
    fn load_base_weights(&self, model: &ResolvedModel) -> anyhow::Result<BaseWeights>;

    /// Read one adapter file as normalized additive deltas.
    fn load_adapter(&self, source: &AdapterSource) -> anyhow::Result<AdapterDelta>;

    fn begin_window(&self, request: &WindowRequest) -> anyhow::Result<LatentState>;

    /// Relative change of the step's modulated input against the previous
    /// step, the signal the step-skip cache thresholds on.
    fn step_distance(&self, state: &LatentState, ctx: &StepContext) -> f32;

    /// Compute one branch's residual for the current step, under the
    /// composed weights prepared for this job.
    fn denoise_step(
        &self,
        model: &EffectiveModel,
        state: &LatentState,
        ctx: &StepContext,
    ) -> anyhow::Result<Array4<f32>>;

    /// Encode one pixel frame `(channels, height, width)` into latent
    /// space, the inverse direction of [`Self::decode_frame`]. Used to
    /// re-encode overlap tails and injected conditioning frames.
    fn encode_frame(&self, pixels: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>>;

    /// Decode one latent frame `(channels, height, width)` to pixels.
    /// Must be pointwise enough that spatial tiling with blended overlaps
    /// reproduces the untiled result.
    fn decode_frame(&self, latent: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>>;
}

/// Deterministic stand-in backend. Latents are seeded from the global
/// frame index, residuals are linear in the state, and decode is the
/// identity, so two windows covering the same global frame produce
/// identical pixels and seam behavior is exactly checkable.
pub struct SyntheticBackend {
    name: String,
    max_native_frames: usize,
    regenerates_overlap: bool,
}

pub const SYNTHETIC_LATENT_CHANNELS: usize = 4;

/// The single tensor the synthetic model exposes to adapters.
pub const SYNTHETIC_TARGET_TENSOR: &str = "blocks.0.proj";

impl SyntheticBackend {
    pub fn new(max_native_frames: usize) -> Self {
        Self {
            name: "synthetic".to_string(),
            max_native_frames,
            regenerates_overlap: true,
        }
    }

    pub fn with_overlap_regeneration(mut self, regenerates: bool) -> Self {
        self.regenerates_overlap = regenerates;
        self
    }
}

impl ModelBackend for SyntheticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_native_frames(&self) -> usize {
        self.max_native_frames
    }

    fn regenerates_overlap(&self) -> bool {
        self.regenerates_overlap
    }

    fn load_base_weights(&self, _model: &ResolvedModel) -> anyhow::Result<BaseWeights> {
        let mut base = BaseWeights::new();
        base.insert(SYNTHETIC_TARGET_TENSOR, Array2::zeros((4, 4)));
        Ok(base)
    }

    fn load_adapter(&self, source: &AdapterSource) -> anyhow::Result<AdapterDelta> {
        // Delta content is derived from the adapter name so distinct
        // adapters (and scales) shift the output by distinct amounts.
        let value = source.name.bytes().map(u32::from).sum::<u32>() % 16;
        let delta = Array2::from_elem((4, 4), value as f32 * 0.01 + 0.01);
        Ok(AdapterDelta {
            name: source.name.clone(),
            tensors: vec![(
                SYNTHETIC_TARGET_TENSOR.to_string(),
                AdapterWeights::Merged { delta },
            )],
        })
    }

    fn begin_window(&self, request: &WindowRequest) -> anyhow::Result<LatentState> {
        anyhow::ensure!(
            request.frame_count > 0,
            "window {} requested zero frames",
            request.window_index
        );
        anyhow::ensure!(
            request.frame_count <= self.max_native_frames,
            "window {} requests {} frames, backend supports at most {}",
            request.window_index,
            request.frame_count,
            self.max_native_frames
        );

        let seed_bias = (request.seed % 7) as f32 * 1e-4;
        let mut state = Array4::zeros((
            SYNTHETIC_LATENT_CHANNELS,
            request.frame_count,
            request.height,
            request.width,
        ));
        for ((_, frame, _, _), value) in state.indexed_iter_mut() {
            *value = (request.start_frame + frame) as f32 + seed_bias;
        }
        Ok(state)
    }

    fn step_distance(&self, _state: &LatentState, ctx: &StepContext) -> f32 {
        // Trajectories settle as denoising progresses.
        1.0 / (ctx.step_index as f32 + 1.0)
    }

    fn denoise_step(
        &self,
        model: &EffectiveModel,
        state: &LatentState,
        ctx: &StepContext,
    ) -> anyhow::Result<Array4<f32>> {
        let gain = match ctx.branch {
            Branch::Conditional => 0.01,
            Branch::Unconditional => 0.005,
        };
        // Composed adapter deltas lift the gain; zero base weights with no
        // adapters reduce to the plain trajectory.
        let gain = gain * (1.0 + model.mean());
        Ok(state * (gain / ctx.total_steps as f32))
    }

    fn encode_frame(&self, pixels: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
        Ok(pixels.to_owned())
    }

    fn decode_frame(&self, latent: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
        Ok(latent.to_owned())
    }
}
