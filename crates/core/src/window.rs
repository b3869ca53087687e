use ndarray::{Array4, Axis};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::EffectiveModel;
use crate::backend::{ModelBackend, StepContext, VideoClip, WindowRequest};
use crate::error::{EngineError, Result};
use crate::job::{JobSpec, Progress};
use crate::resources::tiled_execute;
use crate::stepcache::{Branch, BranchCaches, CacheDecision, CacheMode};

/// One window's slice of the full clip, in global frame indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub index: usize,
    pub start: usize,
    pub len: usize,
}

impl WindowSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Partition `total` frames into overlapping windows. A request that fits
/// in one window yields exactly one span; otherwise each window advances
/// by `window - overlap` frames and the final window is truncated at the
/// clip boundary. The spans cover every frame exactly once net of
/// overlaps: the last span always ends at `total`.
pub fn plan_windows(total: usize, window: usize, overlap: usize) -> Vec<WindowSpan> {
    debug_assert!(window > overlap);

    if total <= window {
        return vec![WindowSpan {
            index: 0,
            start: 0,
            len: total,
        }];
    }

    let stride = window - overlap;
    let count = (total - overlap).div_ceil(stride);
    (0..count)
        .map(|index| {
            let start = index * stride;
            WindowSpan {
                index,
                start,
                len: window.min(total - start),
            }
        })
        .collect()
}

/// How overlap frames from consecutive windows are mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendCurve {
    /// Weight ramps linearly from the previous window to the new one.
    #[default]
    Linear,
    /// Smoothstep ramp, flatter at both ends of the overlap.
    Smooth,
}

impl BlendCurve {
    /// Weight of the NEW window at overlap position `i` of `overlap`
    /// frames. Position 0 is fully the previous window's frame and the
    /// last position is fully the new window's.
    pub fn alpha(&self, i: usize, overlap: usize) -> f32 {
        if overlap <= 1 {
            return 1.0;
        }
        let t = i as f32 / (overlap - 1) as f32;
        match self {
            Self::Linear => t,
            Self::Smooth => t * t * (3.0 - 2.0 * t),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub max_tile_size: usize,
    pub blend: BlendCurve,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            max_tile_size: 256,
            blend: BlendCurve::Linear,
        }
    }
}

/// Run the full sliding-window generation loop for one job: plan windows,
/// denoise each with per-branch step caching, decode (tiled when frames
/// exceed the tile budget), and cross-fade overlaps into the output clip.
///
/// Cancellation is checked at every window and step boundary; a cancelled
/// run returns [`EngineError::Cancelled`] and emits nothing.
pub fn generate(
    backend: &dyn ModelBackend,
    spec: &JobSpec,
    model: &EffectiveModel,
    options: &GeneratorOptions,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(&Progress),
) -> Result<VideoClip> {
    spec.validate()?;

    let window = spec.window_size.min(backend.max_native_frames());
    if window <= spec.window_overlap {
        return Err(EngineError::InvalidSettings(format!(
            "window_overlap {} leaves no new frames per window of {window}",
            spec.window_overlap
        )));
    }

    let spans = plan_windows(spec.frames, window, spec.window_overlap);
    let mut progress = Progress {
        windows_total: spans.len(),
        windows_done: 0,
        steps_total: spans.len() * spec.steps,
        steps_done: 0,
        frames_emitted: 0,
    };
    info!(
        frames = spec.frames,
        windows = spans.len(),
        window,
        overlap = spec.window_overlap,
        "Planned generation windows"
    );

    let mut output: Option<VideoClip> = None;
    for span in &spans {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let overlap_latents = match output.as_ref() {
            Some(out) => {
                let tail = out.slice(ndarray::s![
                    span.start..span.start + spec.window_overlap,
                    ..,
                    ..,
                    ..
                ]);
                Some(encode_overlap(backend, &tail.to_owned(), span.index, options)?)
            }
            None => None,
        };

        let injected = spec
            .injections
            .iter()
            .filter(|injection| injection.frame >= span.start && injection.frame < span.end())
            .map(|injection| (injection.frame - span.start, injection.image.clone()))
            .collect();

        let request = WindowRequest {
            window_index: span.index,
            start_frame: span.start,
            frame_count: span.len,
            width: spec.width,
            height: spec.height,
            seed: spec.seed,
            prompt: spec.prompt.clone(),
            negative_prompt: spec.negative_prompt.clone(),
            overlap_latents,
            references: spec.conditioning.clone(),
            injected,
        };

        let clip = run_window(
            backend,
            spec,
            model,
            options,
            &request,
            cancel,
            &mut |steps_done| {
                progress.steps_done += steps_done;
                on_progress(&progress);
            },
        )?;

        blend_window(&mut output, &clip, span, spec.window_overlap, options.blend, backend)?;

        progress.windows_done += 1;
        progress.frames_emitted = span.end();
        on_progress(&progress);
        debug!(window = span.index, frames = span.end(), "Window blended into clip");
    }

    output.ok_or_else(|| EngineError::InvalidSettings("no windows planned".to_string()))
}

fn run_window(
    backend: &dyn ModelBackend,
    spec: &JobSpec,
    model: &EffectiveModel,
    options: &GeneratorOptions,
    request: &WindowRequest,
    cancel: &CancellationToken,
    on_steps: &mut dyn FnMut(usize),
) -> Result<VideoClip> {
    let mut state = backend
        .begin_window(request)
        .map_err(|source| EngineError::BackendFailure {
            step: format!("begin_window[{}]", request.window_index),
            source,
        })?;

    // Distilled models run with guidance 1.0 and skip the unconditional
    // trajectory entirely.
    let use_cfg = spec.guidance != 1.0;

    let mut caches = match spec.cache {
        CacheMode::Auto { .. } => {
            let trace: Vec<f32> = (0..spec.steps)
                .map(|step_index| {
                    backend.step_distance(
                        &state,
                        &StepContext {
                            step_index,
                            total_steps: spec.steps,
                            guidance: spec.guidance,
                            branch: Branch::Conditional,
                        },
                    )
                })
                .collect();
            BranchCaches::for_mode(spec.cache, Some(&trace))
        }
        _ => BranchCaches::for_mode(spec.cache, None),
    };

    for step_index in 0..spec.steps {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let combined = if use_cfg {
            let cond = branch_residual(
                backend,
                model,
                &state,
                spec,
                step_index,
                Branch::Conditional,
                &mut caches,
            )?;
            let uncond = branch_residual(
                backend,
                model,
                &state,
                spec,
                step_index,
                Branch::Unconditional,
                &mut caches,
            )?;
            &uncond + &((&cond - &uncond) * spec.guidance)
        } else {
            branch_residual(
                backend,
                model,
                &state,
                spec,
                step_index,
                Branch::Conditional,
                &mut caches,
            )?
        };

        state += &combined;
        on_steps(1);
    }

    let (cond_stats, uncond_stats) = caches.stats();
    debug!(
        window = request.window_index,
        cond_computed = cond_stats.computed,
        cond_reused = cond_stats.reused,
        uncond_computed = uncond_stats.computed,
        uncond_reused = uncond_stats.reused,
        "Window denoised"
    );

    decode_window(backend, &state, request, options)
}

fn branch_residual(
    backend: &dyn ModelBackend,
    model: &EffectiveModel,
    state: &Array4<f32>,
    spec: &JobSpec,
    step_index: usize,
    branch: Branch,
    caches: &mut BranchCaches,
) -> Result<Array4<f32>> {
    let ctx = StepContext {
        step_index,
        total_steps: spec.steps,
        guidance: spec.guidance,
        branch,
    };
    let distance = backend.step_distance(state, &ctx);
    let cache = caches.cache_mut(branch);

    match cache.decide(step_index, distance) {
        CacheDecision::Reuse => {
            let residual = cache
                .residual()
                .cloned()
                .ok_or_else(|| EngineError::BackendFailure {
                    step: format!("reuse[{step_index}]"),
                    source: anyhow::anyhow!("reuse decided with no cached residual"),
                })?;
            Ok(residual)
        }
        CacheDecision::Compute => {
            let residual =
                backend
                    .denoise_step(model, state, &ctx)
                    .map_err(|source| EngineError::BackendFailure {
                        step: format!("denoise[{step_index}]"),
                        source,
                    })?;
            cache.record(step_index, residual.clone());
            Ok(residual)
        }
    }
}

/// Re-encode the previous window's decoded tail `(frames, channels,
/// height, width)` into latent layout `(channels, frames, height, width)`
/// for seam conditioning.
fn encode_overlap(
    backend: &dyn ModelBackend,
    tail: &VideoClip,
    window_index: usize,
    options: &GeneratorOptions,
) -> Result<crate::backend::LatentState> {
    let (frames, channels, height, width) = tail.dim();
    let needs_tiling = height > options.max_tile_size || width > options.max_tile_size;

    let mut latents = Array4::zeros((channels, frames, height, width));
    for frame in 0..frames {
        let pixels = tail.index_axis(Axis(0), frame);
        let encoded = if needs_tiling {
            tiled_execute(
                |tile| backend.encode_frame(tile),
                &pixels.to_owned(),
                options.max_tile_size,
            )
        } else {
            backend.encode_frame(pixels)
        }
        .map_err(|source| EngineError::BackendFailure {
            step: format!("encode[{window_index}:{frame}]"),
            source,
        })?;
        latents
            .index_axis_mut(Axis(1), frame)
            .assign(&encoded);
    }
    Ok(latents)
}

fn decode_window(
    backend: &dyn ModelBackend,
    state: &Array4<f32>,
    request: &WindowRequest,
    options: &GeneratorOptions,
) -> Result<VideoClip> {
    let (channels, frames, height, width) = state.dim();
    let needs_tiling = height > options.max_tile_size || width > options.max_tile_size;

    let mut clip = Array4::zeros((frames, channels, height, width));
    for frame in 0..frames {
        let latent = state.index_axis(Axis(1), frame);
        let decoded = if needs_tiling {
            tiled_execute(
                |tile| backend.decode_frame(tile),
                &latent.to_owned(),
                options.max_tile_size,
            )
        } else {
            backend.decode_frame(latent)
        }
        .map_err(|source| EngineError::BackendFailure {
            step: format!("decode[{}:{frame}]", request.window_index),
            source,
        })?;
        clip.index_axis_mut(Axis(0), frame).assign(&decoded);
    }
    Ok(clip)
}

/// Merge a decoded window into the running output. For the first window
/// this is a plain append. For later windows the overlap region is either
/// cross-faded (backends that re-denoise the overlap) or kept from the
/// previous window (backends that only condition on it); frames past the
/// overlap are appended.
fn blend_window(
    output: &mut Option<VideoClip>,
    clip: &VideoClip,
    span: &WindowSpan,
    overlap: usize,
    curve: BlendCurve,
    backend: &dyn ModelBackend,
) -> Result<()> {
    let Some(existing) = output else {
        *output = Some(clip.clone());
        return Ok(());
    };

    let (_, channels, height, width) = clip.dim();
    let mut grown = Array4::zeros((span.end(), channels, height, width));
    grown
        .slice_mut(ndarray::s![..existing.dim().0, .., .., ..])
        .assign(existing);

    if backend.regenerates_overlap() {
        for local in 0..overlap.min(span.len) {
            let global = span.start + local;
            let alpha = curve.alpha(local, overlap);
            let previous = existing.index_axis(Axis(0), global).to_owned();
            let fresh = clip.index_axis(Axis(0), local);
            let mixed = &previous * (1.0 - alpha) + &fresh.to_owned() * alpha;
            grown.index_axis_mut(Axis(0), global).assign(&mixed);
        }
    }

    for local in overlap..span.len {
        let global = span.start + local;
        grown
            .index_axis_mut(Axis(0), global)
            .assign(&clip.index_axis(Axis(0), local));
    }

    *output = Some(grown);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyntheticBackend;
    use crate::job::JobSpec;

    fn spec(frames: usize, window: usize, overlap: usize) -> JobSpec {
        JobSpec {
            model: "synthetic".to_string(),
            prompt: "test".to_string(),
            negative_prompt: String::new(),
            frames,
            width: 8,
            height: 8,
            steps: 4,
            guidance: 5.0,
            seed: 7,
            window_size: window,
            window_overlap: overlap,
            cache: CacheMode::Off,
            adapters: Vec::new(),
            conditioning: Default::default(),
            injections: Vec::new(),
        }
    }

    fn run(backend: &SyntheticBackend, spec: &JobSpec) -> VideoClip {
        let cancel = CancellationToken::new();
        generate(
            backend,
            spec,
            &EffectiveModel::default(),
            &GeneratorOptions::default(),
            &cancel,
            &mut |_| {},
        )
        .unwrap()
    }

    #[test]
    fn plan_single_window_when_clip_fits() {
        let spans = plan_windows(80, 100, 20);
        assert_eq!(
            spans,
            vec![WindowSpan {
                index: 0,
                start: 0,
                len: 80
            }]
        );
    }

    #[test]
    fn plan_180_frames_window_100_overlap_20_yields_two_windows() {
        let spans = plan_windows(180, 100, 20);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].start, spans[0].len), (0, 100));
        assert_eq!((spans[1].start, spans[1].len), (80, 100));
        assert_eq!(spans[1].end(), 180);
    }

    #[test]
    fn plan_truncates_final_window() {
        let spans = plan_windows(150, 100, 20);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[1].start, spans[1].len), (80, 70));
        assert_eq!(spans[1].end(), 150);
    }

    #[test]
    fn plan_last_window_always_ends_at_total() {
        for total in [1, 5, 81, 100, 101, 179, 180, 181, 500] {
            let spans = plan_windows(total, 100, 20);
            assert_eq!(spans.last().unwrap().end(), total, "total {total}");
            // Every frame covered.
            let mut next_uncovered = 0;
            for span in &spans {
                assert!(span.start <= next_uncovered);
                next_uncovered = next_uncovered.max(span.end());
            }
            assert_eq!(next_uncovered, total);
        }
    }

    #[test]
    fn blend_curve_endpoints() {
        for curve in [BlendCurve::Linear, BlendCurve::Smooth] {
            assert_eq!(curve.alpha(0, 20), 0.0);
            assert_eq!(curve.alpha(19, 20), 1.0);
            assert_eq!(curve.alpha(0, 1), 1.0);
        }
        assert_eq!(BlendCurve::Linear.alpha(5, 11), 0.5);
        assert_eq!(BlendCurve::Smooth.alpha(5, 11), 0.5);
    }

    #[test]
    fn multi_window_clip_has_exact_frame_count_and_no_seam_duplicates() {
        let backend = SyntheticBackend::new(6);
        let spec = spec(12, 6, 2);
        let out = run(&backend, &spec);
        assert_eq!(out.dim().0, 12);

        // Synthetic frame values grow with the global index, so duplicated
        // or dropped seam frames would break strict monotonicity.
        let values: Vec<f32> = (0..12).map(|f| out[[f, 0, 0, 0]]).collect();
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1], "frames not strictly ordered: {values:?}");
        }
    }

    #[test]
    fn windowed_run_matches_single_window_run() {
        // Same clip generated in one window and in three must agree: the
        // synthetic backend derives every frame from its global index, so
        // cross-fading identical overlap frames is exact.
        let single = run(&SyntheticBackend::new(16), &spec(12, 16, 2));
        let windowed = run(&SyntheticBackend::new(6), &spec(12, 6, 2));
        assert_eq!(single.dim(), windowed.dim());
        for f in 0..12 {
            let a = single[[f, 0, 0, 0]];
            let b = windowed[[f, 0, 0, 0]];
            assert!((a - b).abs() < 1e-3, "frame {f}: {a} vs {b}");
        }
    }

    #[test]
    fn non_regenerating_backend_keeps_previous_overlap_frames() {
        let backend = SyntheticBackend::new(6).with_overlap_regeneration(false);
        let out = run(&backend, &spec(12, 6, 2));
        assert_eq!(out.dim().0, 12);
        let values: Vec<f32> = (0..12).map(|f| out[[f, 0, 0, 0]]).collect();
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn cancelled_before_start_emits_nothing() {
        let backend = SyntheticBackend::new(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = generate(
            &backend,
            &spec(12, 6, 2),
            &EffectiveModel::default(),
            &GeneratorOptions::default(),
            &cancel,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn progress_reaches_totals() {
        let backend = SyntheticBackend::new(6);
        let spec = spec(12, 6, 2);
        let cancel = CancellationToken::new();
        let mut last = Progress::default();
        generate(
            &backend,
            &spec,
            &EffectiveModel::default(),
            &GeneratorOptions::default(),
            &cancel,
            &mut |p| last = *p,
        )
        .unwrap();
        assert_eq!(last.windows_done, last.windows_total);
        assert_eq!(last.steps_done, last.steps_total);
        assert_eq!(last.frames_emitted, 12);
    }

    #[test]
    fn guidance_one_skips_unconditional_branch() {
        let backend = SyntheticBackend::new(16);
        let mut distilled = spec(8, 16, 2);
        distilled.guidance = 1.0;
        distilled.steps = 4;
        // Just exercises the single-branch path end to end.
        let out = run(&backend, &distilled);
        assert_eq!(out.dim().0, 8);
    }

    #[test]
    fn window_size_larger_than_backend_native_is_clamped() {
        let backend = SyntheticBackend::new(6);
        let clamped = spec(12, 100, 2);
        let out = run(&backend, &clamped);
        assert_eq!(out.dim().0, 12);
    }

    #[test]
    fn composed_weights_change_the_output() {
        use crate::backend::SYNTHETIC_TARGET_TENSOR;

        let backend = SyntheticBackend::new(16);
        let spec = spec(8, 16, 2);
        let plain = run(&backend, &spec);

        let mut adapted = EffectiveModel::new();
        adapted.insert(SYNTHETIC_TARGET_TENSOR, ndarray::Array2::from_elem((4, 4), 0.1));
        let cancel = CancellationToken::new();
        let lifted = generate(
            &backend,
            &spec,
            &adapted,
            &GeneratorOptions::default(),
            &cancel,
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(plain.dim(), lifted.dim());
        assert_ne!(plain, lifted, "adapter deltas must shift the trajectory");
        // The lift is multiplicative on positive values, so ordering holds.
        let values: Vec<f32> = (0..8).map(|f| lifted[[f, 0, 0, 0]]).collect();
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn fixed_cache_reduces_computed_steps_but_preserves_length() {
        let backend = SyntheticBackend::new(16);
        let mut cached = spec(8, 16, 2);
        cached.steps = 12;
        cached.cache = CacheMode::Fixed { threshold: 0.9 };
        let out = run(&backend, &cached);
        assert_eq!(out.dim().0, 8);
    }

    #[test]
    fn injections_reach_their_window_at_local_indices() {
        use std::sync::Mutex;

        struct Recording {
            inner: SyntheticBackend,
            seen: Mutex<Vec<(usize, Vec<usize>)>>,
        }

        impl ModelBackend for Recording {
            fn name(&self) -> &str {
                self.inner.name()
            }
            fn max_native_frames(&self) -> usize {
                self.inner.max_native_frames()
            }
            fn regenerates_overlap(&self) -> bool {
                self.inner.regenerates_overlap()
            }
            fn begin_window(
                &self,
                request: &WindowRequest,
            ) -> anyhow::Result<crate::backend::LatentState> {
                let locals = request.injected.iter().map(|(i, _)| *i).collect();
                self.seen
                    .lock()
                    .unwrap()
                    .push((request.window_index, locals));
                self.inner.begin_window(request)
            }
            fn step_distance(&self, state: &crate::backend::LatentState, ctx: &StepContext) -> f32 {
                self.inner.step_distance(state, ctx)
            }
            fn load_base_weights(
                &self,
                model: &crate::registry::ResolvedModel,
            ) -> anyhow::Result<crate::adapters::BaseWeights> {
                self.inner.load_base_weights(model)
            }
            fn load_adapter(
                &self,
                source: &crate::registry::AdapterSource,
            ) -> anyhow::Result<crate::adapters::AdapterDelta> {
                self.inner.load_adapter(source)
            }
            fn denoise_step(
                &self,
                model: &EffectiveModel,
                state: &crate::backend::LatentState,
                ctx: &StepContext,
            ) -> anyhow::Result<Array4<f32>> {
                self.inner.denoise_step(model, state, ctx)
            }
            fn encode_frame(
                &self,
                pixels: ndarray::ArrayView3<'_, f32>,
            ) -> anyhow::Result<ndarray::Array3<f32>> {
                self.inner.encode_frame(pixels)
            }
            fn decode_frame(
                &self,
                latent: ndarray::ArrayView3<'_, f32>,
            ) -> anyhow::Result<ndarray::Array3<f32>> {
                self.inner.decode_frame(latent)
            }
        }

        let backend = Recording {
            inner: SyntheticBackend::new(6),
            seen: Mutex::new(Vec::new()),
        };
        // Windows: [0..6), [4..10), [8..12) with overlap 2. Global frame 5
        // falls in the first two; frame 10 only in the last.
        let mut with_injections = spec(12, 6, 2);
        with_injections.injections = vec![
            crate::job::FrameInjection {
                frame: 5,
                image: "a.png".into(),
            },
            crate::job::FrameInjection {
                frame: 10,
                image: "b.png".into(),
            },
        ];
        let cancel = CancellationToken::new();
        generate(
            &backend,
            &with_injections,
            &EffectiveModel::default(),
            &GeneratorOptions::default(),
            &cancel,
            &mut |_| {},
        )
        .unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0], (0, vec![5]));
        assert_eq!(seen[1], (1, vec![1]));
        assert_eq!(seen[2], (2, vec![2]));
    }

    #[test]
    fn auto_cache_runs_calibration_and_completes() {
        let backend = SyntheticBackend::new(16);
        let mut auto = spec(8, 16, 2);
        auto.steps = 12;
        auto.cache = CacheMode::Auto {
            target_speedup: 1.5,
        };
        let out = run(&backend, &auto);
        assert_eq!(out.dim().0, 8);
    }
}
