use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::stepcache::CacheMode;

/// One adapter selection in a job, by registry name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSelection {
    pub name: String,
    #[serde(default = "default_adapter_scale")]
    pub scale: f32,
}

fn default_adapter_scale() -> f32 {
    1.0
}

/// Image/video references that steer a generation. All optional; which of
/// them a given architecture honors is the backend's business.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditioning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_image: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_image: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_video: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_video: Option<PathBuf>,
}

impl Conditioning {
    pub fn is_empty(&self) -> bool {
        self.start_image.is_none()
            && self.end_image.is_none()
            && self.reference_image.is_none()
            && self.control_video.is_none()
            && self.mask_video.is_none()
    }
}

/// A frame forced into the clip at a fixed global index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInjection {
    pub frame: usize,
    pub image: PathBuf,
}

/// Everything needed to reproduce a generation run. Serialized flat so
/// exported settings files stay hand-editable; import of an exported
/// spec yields an equivalent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub frames: usize,
    pub width: usize,
    pub height: usize,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_window_overlap")]
    pub window_overlap: usize,
    #[serde(default)]
    pub cache: CacheMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<AdapterSelection>,
    #[serde(default, skip_serializing_if = "Conditioning::is_empty")]
    pub conditioning: Conditioning,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injections: Vec<FrameInjection>,
}

fn default_steps() -> usize {
    30
}

fn default_guidance() -> f32 {
    5.0
}

fn default_window_size() -> usize {
    81
}

fn default_window_overlap() -> usize {
    16
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.frames == 0 {
            return Err(EngineError::InvalidSettings(
                "frames must be at least 1".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidSettings(format!(
                "resolution {}x{} is not valid",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(EngineError::InvalidSettings(
                "steps must be at least 1".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(EngineError::InvalidSettings(
                "window_size must be at least 1".to_string(),
            ));
        }
        if self.window_overlap >= self.window_size {
            return Err(EngineError::InvalidSettings(format!(
                "window_overlap {} must be smaller than window_size {}",
                self.window_overlap, self.window_size
            )));
        }
        if !self.guidance.is_finite() || self.guidance < 0.0 {
            return Err(EngineError::InvalidSettings(format!(
                "guidance {} is not valid",
                self.guidance
            )));
        }
        for adapter in &self.adapters {
            if !adapter.scale.is_finite() {
                return Err(EngineError::InvalidSettings(format!(
                    "adapter '{}' has a non-finite scale",
                    adapter.name
                )));
            }
        }
        if let CacheMode::Fixed { threshold } = self.cache {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(EngineError::InvalidSettings(format!(
                    "cache threshold {threshold} is not valid"
                )));
            }
        }
        if let CacheMode::Auto { target_speedup } = self.cache {
            if !target_speedup.is_finite() || target_speedup < 1.0 {
                return Err(EngineError::InvalidSettings(format!(
                    "cache target speedup {target_speedup} must be at least 1.0"
                )));
            }
        }
        for injection in &self.injections {
            if injection.frame >= self.frames {
                return Err(EngineError::InvalidSettings(format!(
                    "injected frame {} is outside the clip (0..{})",
                    injection.frame, self.frames
                )));
            }
        }
        Ok(())
    }

    /// Every filesystem path this job reads during preprocessing.
    pub fn conditioning_input_paths(&self) -> Vec<PathBuf> {
        let refs = &self.conditioning;
        [
            &refs.start_image,
            &refs.end_image,
            &refs.reference_image,
            &refs.control_video,
            &refs.mask_video,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .chain(self.injections.iter().map(|i| i.image.clone()))
        .collect()
    }

    pub fn export_to_path(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize job settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    pub fn import_from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let spec: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        Ok(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub windows_total: usize,
    pub windows_done: usize,
    pub steps_total: usize,
    pub steps_done: usize,
    pub frames_emitted: usize,
}

/// Queue-visible snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec,
            status: JobStatus::Queued,
            progress: Progress::default(),
            created_at: now,
            updated_at: now,
            error: None,
            output_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            model: "wan-t2v-1.3b".to_string(),
            prompt: "a red fox running through snow".to_string(),
            negative_prompt: String::new(),
            frames: 180,
            width: 832,
            height: 480,
            steps: 30,
            guidance: 5.0,
            seed: 42,
            window_size: 100,
            window_overlap: 20,
            cache: CacheMode::Fixed { threshold: 0.15 },
            adapters: vec![AdapterSelection {
                name: "detail-enhancer".to_string(),
                scale: 0.8,
            }],
            conditioning: Conditioning {
                start_image: Some(PathBuf::from("refs/first.png")),
                ..Conditioning::default()
            },
            injections: vec![FrameInjection {
                frame: 90,
                image: PathBuf::from("refs/mid.png"),
            }],
        }
    }

    #[test]
    fn valid_spec_passes() {
        spec().validate().unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let mut bad = spec();
        bad.window_overlap = bad.window_size;
        assert!(matches!(
            bad.validate().unwrap_err(),
            EngineError::InvalidSettings(_)
        ));
    }

    #[test]
    fn zero_frames_rejected() {
        let mut bad = spec();
        bad.frames = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn auto_cache_target_below_one_rejected() {
        let mut bad = spec();
        bad.cache = CacheMode::Auto {
            target_speedup: 0.5,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let original = spec();
        original.export_to_path(&path).unwrap();

        let restored = JobSpec::import_from_path(&path).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{
            "model": "wan-t2v-14b",
            "prompt": "dunes at sunset",
            "frames": 48,
            "width": 640,
            "height": 368
        }"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.steps, 30);
        assert_eq!(spec.window_size, 81);
        assert_eq!(spec.window_overlap, 16);
        assert_eq!(spec.cache, CacheMode::Off);
        assert!(spec.adapters.is_empty());
        assert!(spec.conditioning.is_empty());
        assert!(spec.injections.is_empty());
        spec.validate().unwrap();
    }

    #[test]
    fn injection_outside_clip_rejected() {
        let mut bad = spec();
        bad.injections[0].frame = bad.frames;
        assert!(matches!(
            bad.validate().unwrap_err(),
            EngineError::InvalidSettings(_)
        ));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
