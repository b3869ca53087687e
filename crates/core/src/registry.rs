use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Closed set of supported model architectures. Descriptors reference one
/// of these; there is no runtime plugin loading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    WanTextToVideo,
    WanImageToVideo,
    HunyuanVideo,
    Ltx,
    Flux,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WanTextToVideo => write!(f, "wan_t2v"),
            Self::WanImageToVideo => write!(f, "wan_i2v"),
            Self::HunyuanVideo => write!(f, "hunyuan_video"),
            Self::Ltx => write!(f, "ltx"),
            Self::Flux => write!(f, "flux"),
        }
    }
}

/// One weight file a model is built from. Size is declared up front so the
/// resource manager can budget without touching the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightSource {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

/// Adapter baked into a model descriptor at a fixed scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedAdapter {
    pub adapter: String,
    pub scale: f32,
}

/// A named adapter ("LoRA") weight file known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterSource {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

/// Persisted model descriptor. Fields left `None`/empty inherit from the
/// optional parent; resolution is a pure merge, not state inheritance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weights: Vec<WeightSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedded_adapters: Vec<EmbeddedAdapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    /// Default job parameters (e.g. steps, guidance) applied when the job
    /// settings leave them unset.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, serde_json::Value>,
}

/// Fully merged view of a descriptor chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub name: String,
    pub architecture: Architecture,
    pub weights: Vec<WeightSource>,
    pub embedded_adapters: Vec<EmbeddedAdapter>,
    pub display_name: String,
    pub visible: bool,
    pub defaults: BTreeMap<String, serde_json::Value>,
}

impl ResolvedModel {
    pub fn total_weight_bytes(&self) -> u64 {
        self.weights.iter().map(|w| w.size_bytes).sum()
    }

    /// Residency entries this model needs: one per weight file, keyed by
    /// the model name plus the weight path.
    pub fn residency_entries(&self) -> Vec<(String, u64)> {
        self.weights
            .iter()
            .map(|w| (format!("{}:{}", self.name, w.path.display()), w.size_bytes))
            .collect()
    }
}

fn builtin_catalog() -> (Vec<ModelDescriptor>, Vec<AdapterSource>) {
    let models = vec![
        ModelDescriptor {
            name: "wan-t2v-1.3b".into(),
            parent: None,
            architecture: Some(Architecture::WanTextToVideo),
            weights: vec![WeightSource {
                path: PathBuf::from("wan2.1_t2v_1.3B_bf16.safetensors"),
                size_bytes: 2_850_000_000,
                sha256: None,
            }],
            embedded_adapters: Vec::new(),
            display_name: Some("Wan 2.1 Text-to-Video 1.3B".into()),
            visible: Some(true),
            defaults: BTreeMap::from([
                ("steps".to_string(), serde_json::json!(30)),
                ("guidance".to_string(), serde_json::json!(5.0)),
            ]),
        },
        ModelDescriptor {
            name: "wan-t2v-14b".into(),
            parent: None,
            architecture: Some(Architecture::WanTextToVideo),
            weights: vec![WeightSource {
                path: PathBuf::from("wan2.1_t2v_14B_quanto_int8.safetensors"),
                size_bytes: 15_400_000_000,
                sha256: None,
            }],
            embedded_adapters: Vec::new(),
            display_name: Some("Wan 2.1 Text-to-Video 14B".into()),
            visible: Some(true),
            defaults: BTreeMap::from([
                ("steps".to_string(), serde_json::json!(30)),
                ("guidance".to_string(), serde_json::json!(5.0)),
            ]),
        },
        // Distilled finetune: same weights as the 14B base plus a baked-in
        // acceleration LoRA and few-step defaults.
        ModelDescriptor {
            name: "wan-t2v-14b-lightning".into(),
            parent: Some("wan-t2v-14b".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: vec![EmbeddedAdapter {
                adapter: "lightning-4step".into(),
                scale: 1.0,
            }],
            display_name: Some("Wan 2.1 14B Lightning".into()),
            visible: Some(true),
            defaults: BTreeMap::from([
                ("steps".to_string(), serde_json::json!(4)),
                ("guidance".to_string(), serde_json::json!(1.0)),
            ]),
        },
        ModelDescriptor {
            name: "wan-i2v-14b".into(),
            parent: None,
            architecture: Some(Architecture::WanImageToVideo),
            weights: vec![WeightSource {
                path: PathBuf::from("wan2.1_i2v_14B_quanto_int8.safetensors"),
                size_bytes: 16_100_000_000,
                sha256: None,
            }],
            embedded_adapters: Vec::new(),
            display_name: Some("Wan 2.1 Image-to-Video 14B".into()),
            visible: Some(true),
            defaults: BTreeMap::new(),
        },
    ];

    let adapters = vec![
        AdapterSource {
            name: "lightning-4step".into(),
            path: PathBuf::from("loras/wan_lightning_4step.safetensors"),
            size_bytes: 650_000_000,
            sha256: None,
        },
        AdapterSource {
            name: "detail-enhancer".into(),
            path: PathBuf::from("loras/wan_detail_enhancer.safetensors"),
            size_bytes: 320_000_000,
            sha256: None,
        },
    ];

    (models, adapters)
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    models: Vec<ModelDescriptor>,
    adapters: Vec<AdapterSource>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            models: Vec::new(),
            adapters: Vec::new(),
        }
    }

    pub fn with_builtin_catalog(models_dir: PathBuf) -> Self {
        let (models, adapters) = builtin_catalog();
        Self {
            models_dir,
            models,
            adapters,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn adapter(&self, name: &str) -> Option<&AdapterSource> {
        self.adapters.iter().find(|a| a.name == name)
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn list_adapters(&self) -> &[AdapterSource] {
        &self.adapters
    }

    pub fn add_model(&mut self, descriptor: ModelDescriptor) {
        if let Some(existing) = self.models.iter_mut().find(|m| m.name == descriptor.name) {
            *existing = descriptor;
        } else {
            self.models.push(descriptor);
        }
    }

    pub fn add_adapter(&mut self, adapter: AdapterSource) {
        if let Some(existing) = self.adapters.iter_mut().find(|a| a.name == adapter.name) {
            *existing = adapter;
        } else {
            self.adapters.push(adapter);
        }
    }

    /// Resolve a descriptor chain into a merged model view.
    ///
    /// Parent fields are merged first; the child's explicit fields win
    /// field-by-field. Embedded adapter lists are unioned keyed by adapter
    /// id (a child entry overrides the parent's scale for the same id).
    /// Pure over the registry contents: resolving twice yields identical
    /// output.
    pub fn resolve(&self, name: &str) -> Result<ResolvedModel> {
        let mut chain = Vec::new();
        let mut stack = Vec::new();
        let mut current = name.to_string();

        // Walk to the root, collecting the chain and rejecting revisits.
        loop {
            if stack.contains(&current) {
                stack.push(current);
                return Err(EngineError::CyclicReference { chain: stack });
            }

            let descriptor = self.get(&current).ok_or_else(|| {
                EngineError::UnresolvedReference {
                    root: name.to_string(),
                    reference: current.clone(),
                }
            })?;

            stack.push(current.clone());
            chain.push(descriptor);

            match &descriptor.parent {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }

        // Merge root-first so each child overrides its parent.
        let mut architecture = None;
        let mut weights: Vec<WeightSource> = Vec::new();
        let mut embedded: Vec<EmbeddedAdapter> = Vec::new();
        let mut display_name = None;
        let mut visible = None;
        let mut defaults = BTreeMap::new();

        for descriptor in chain.iter().rev() {
            if descriptor.architecture.is_some() {
                architecture = descriptor.architecture;
            }
            if !descriptor.weights.is_empty() {
                weights = descriptor.weights.clone();
            }
            for entry in &descriptor.embedded_adapters {
                match embedded.iter_mut().find(|e| e.adapter == entry.adapter) {
                    Some(existing) => existing.scale = entry.scale,
                    None => embedded.push(entry.clone()),
                }
            }
            if descriptor.display_name.is_some() {
                display_name = descriptor.display_name.clone();
            }
            if descriptor.visible.is_some() {
                visible = descriptor.visible;
            }
            for (key, value) in &descriptor.defaults {
                defaults.insert(key.clone(), value.clone());
            }
        }

        let architecture = architecture.ok_or_else(|| EngineError::UnresolvedReference {
            root: name.to_string(),
            reference: format!("{name}#architecture"),
        })?;

        // Every referenced adapter must be known, otherwise the job would
        // fail much later during composition.
        for entry in &embedded {
            if self.adapter(&entry.adapter).is_none() {
                return Err(EngineError::UnresolvedReference {
                    root: name.to_string(),
                    reference: entry.adapter.clone(),
                });
            }
        }

        Ok(ResolvedModel {
            name: name.to_string(),
            architecture,
            weights,
            embedded_adapters: embedded,
            display_name: display_name.unwrap_or_else(|| name.to_string()),
            visible: visible.unwrap_or(true),
            defaults,
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let catalog = CatalogFile {
            models: self.models.clone(),
            adapters: self.adapters.clone(),
        };
        serde_json::to_string_pretty(&catalog).context("failed to serialize model catalog")
    }

    /// Merge descriptors from a JSON catalog. Existing names are replaced,
    /// new names appended; load order is preserved for everything else.
    pub fn load_json(&mut self, json: &str) -> anyhow::Result<()> {
        let catalog: CatalogFile =
            serde_json::from_str(json).context("failed to parse model catalog JSON")?;
        for model in catalog.models {
            self.add_model(model);
        }
        for adapter in catalog.adapters {
            self.add_adapter(adapter);
        }
        Ok(())
    }

    pub fn load_catalog_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model catalog: {}", path.display()))?;
        self.load_json(&raw)
            .with_context(|| format!("invalid model catalog: {}", path.display()))?;
        info!(path = %path.display(), "Loaded model catalog");
        Ok(())
    }

    /// Verify declared sha256 hashes of a resolved model's on-disk weight
    /// files. Sources without a declared hash are skipped with a warning.
    pub fn verify_weights(&self, model: &ResolvedModel) -> anyhow::Result<()> {
        for source in &model.weights {
            let path = self.models_dir.join(&source.path);
            let Some(expected) = source.sha256.as_deref() else {
                warn!(weight = %path.display(), "No sha256 declared; skipping verification");
                continue;
            };

            let actual = sha256_file(&path)?;
            if actual != expected {
                anyhow::bail!(
                    "sha256 mismatch for {}: expected {expected}, got {actual}",
                    path.display()
                );
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
    #[serde(default)]
    adapters: Vec<AdapterSource>,
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        ModelRegistry::with_builtin_catalog(std::env::temp_dir().join("models"))
    }

    #[test]
    fn builtin_catalog_resolves_base_model() {
        let reg = registry();
        let model = reg.resolve("wan-t2v-1.3b").expect("resolve base model");
        assert_eq!(model.architecture, Architecture::WanTextToVideo);
        assert_eq!(model.weights.len(), 1);
        assert_eq!(model.total_weight_bytes(), 2_850_000_000);
        assert!(model.embedded_adapters.is_empty());
        assert!(model.visible);
    }

    #[test]
    fn chain_resolution_merges_parent_fields() {
        let reg = registry();
        let model = reg
            .resolve("wan-t2v-14b-lightning")
            .expect("resolve finetune chain");

        // Weights inherited from the parent.
        assert_eq!(model.weights, reg.get("wan-t2v-14b").unwrap().weights);
        assert_eq!(model.architecture, Architecture::WanTextToVideo);
        // Child fields win.
        assert_eq!(model.display_name, "Wan 2.1 14B Lightning");
        assert_eq!(model.defaults.get("steps"), Some(&serde_json::json!(4)));
        assert_eq!(
            model.defaults.get("guidance"),
            Some(&serde_json::json!(1.0))
        );
        // Embedded adapter carried with its fixed scale.
        assert_eq!(model.embedded_adapters.len(), 1);
        assert_eq!(model.embedded_adapters[0].adapter, "lightning-4step");
        assert_eq!(model.embedded_adapters[0].scale, 1.0);
    }

    #[test]
    fn resolution_is_idempotent() {
        let reg = registry();
        let first = reg.resolve("wan-t2v-14b-lightning").unwrap();
        let second = reg.resolve("wan-t2v-14b-lightning").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn embedded_adapter_scale_overridden_by_child() {
        let mut reg = registry();
        reg.add_model(ModelDescriptor {
            name: "lightning-soft".into(),
            parent: Some("wan-t2v-14b-lightning".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: vec![EmbeddedAdapter {
                adapter: "lightning-4step".into(),
                scale: 0.5,
            }],
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        let model = reg.resolve("lightning-soft").unwrap();
        assert_eq!(model.embedded_adapters.len(), 1, "union, not append");
        assert_eq!(model.embedded_adapters[0].scale, 0.5);
    }

    #[test]
    fn embedded_adapter_lists_union_across_chain() {
        let mut reg = registry();
        reg.add_model(ModelDescriptor {
            name: "lightning-detailed".into(),
            parent: Some("wan-t2v-14b-lightning".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: vec![EmbeddedAdapter {
                adapter: "detail-enhancer".into(),
                scale: 0.8,
            }],
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        let model = reg.resolve("lightning-detailed").unwrap();
        let names: Vec<&str> = model
            .embedded_adapters
            .iter()
            .map(|e| e.adapter.as_str())
            .collect();
        assert_eq!(names, vec!["lightning-4step", "detail-enhancer"]);
    }

    #[test]
    fn unknown_model_is_unresolved_reference() {
        let reg = registry();
        let err = reg.resolve("no-such-model").unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference { .. }));
    }

    #[test]
    fn unknown_parent_is_unresolved_reference() {
        let mut reg = registry();
        reg.add_model(ModelDescriptor {
            name: "orphan".into(),
            parent: Some("ghost-parent".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: Vec::new(),
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        match reg.resolve("orphan").unwrap_err() {
            EngineError::UnresolvedReference { root, reference } => {
                assert_eq!(root, "orphan");
                assert_eq!(reference, "ghost-parent");
            }
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn unknown_embedded_adapter_is_unresolved_reference() {
        let mut reg = registry();
        reg.add_model(ModelDescriptor {
            name: "bad-adapter-ref".into(),
            parent: Some("wan-t2v-1.3b".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: vec![EmbeddedAdapter {
                adapter: "missing-lora".into(),
                scale: 1.0,
            }],
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        match reg.resolve("bad-adapter-ref").unwrap_err() {
            EngineError::UnresolvedReference { reference, .. } => {
                assert_eq!(reference, "missing-lora");
            }
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_chain_fails_instead_of_looping() {
        let mut reg = registry();
        for (name, parent) in [("cycle-a", "cycle-b"), ("cycle-b", "cycle-a")] {
            reg.add_model(ModelDescriptor {
                name: name.into(),
                parent: Some(parent.into()),
                architecture: None,
                weights: Vec::new(),
                embedded_adapters: Vec::new(),
                display_name: None,
                visible: None,
                defaults: BTreeMap::new(),
            });
        }

        match reg.resolve("cycle-a").unwrap_err() {
            EngineError::CyclicReference { chain } => {
                assert_eq!(chain, vec!["cycle-a", "cycle-b", "cycle-a"]);
            }
            other => panic!("expected CyclicReference, got {other:?}"),
        }
    }

    #[test]
    fn self_referential_chain_is_cyclic() {
        let mut reg = registry();
        reg.add_model(ModelDescriptor {
            name: "narcissus".into(),
            parent: Some("narcissus".into()),
            architecture: None,
            weights: Vec::new(),
            embedded_adapters: Vec::new(),
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        assert!(matches!(
            reg.resolve("narcissus").unwrap_err(),
            EngineError::CyclicReference { .. }
        ));
    }

    #[test]
    fn json_roundtrip_preserves_catalog() {
        let reg = registry();
        let json = reg.to_json().expect("serialize catalog");

        let mut reg2 = ModelRegistry::new(std::env::temp_dir().join("models"));
        reg2.load_json(&json).expect("load catalog");

        assert_eq!(reg2.list(), reg.list());
        assert_eq!(reg2.list_adapters(), reg.list_adapters());
        // Round-trip again: re-serializing an unmodified catalog is stable.
        assert_eq!(reg2.to_json().unwrap(), json);
    }

    #[test]
    fn load_json_replaces_same_name() {
        let mut reg = registry();
        let count = reg.list().len();
        reg.load_json(
            r#"{"models":[{"name":"wan-t2v-1.3b","architecture":"wan_t2v","display_name":"patched"}]}"#,
        )
        .expect("load patch");

        assert_eq!(reg.list().len(), count);
        assert_eq!(
            reg.get("wan-t2v-1.3b").unwrap().display_name.as_deref(),
            Some("patched")
        );
    }

    #[test]
    fn residency_entries_cover_all_weights() {
        let reg = registry();
        let model = reg.resolve("wan-t2v-14b").unwrap();
        let entries = model.residency_entries();
        assert_eq!(entries.len(), model.weights.len());
        assert_eq!(
            entries.iter().map(|(_, size)| size).sum::<u64>(),
            model.total_weight_bytes()
        );
        assert!(entries[0].0.starts_with("wan-t2v-14b:"));
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("weights.bin");
        fs::write(&path, b"hello world").unwrap();
        let hash = sha256_file(&path).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn verify_weights_detects_mismatch() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("w.bin"), b"weights").unwrap();

        let mut reg = ModelRegistry::new(dir.path().to_path_buf());
        reg.add_model(ModelDescriptor {
            name: "tiny".into(),
            parent: None,
            architecture: Some(Architecture::Ltx),
            weights: vec![WeightSource {
                path: PathBuf::from("w.bin"),
                size_bytes: 7,
                sha256: Some("0".repeat(64)),
            }],
            embedded_adapters: Vec::new(),
            display_name: None,
            visible: None,
            defaults: BTreeMap::new(),
        });

        let model = reg.resolve("tiny").unwrap();
        let err = reg.verify_weights(&model).unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }
}
