//! Model source and model spec type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::backend::{self, Backend};
use crate::error::{FleetError, FleetResult};

/// Where model files come from.
///
/// Each variant carries the identifier that is mandatory for it, so a
/// constructed source always has its tag-matching field populated. The wire
/// form is the flat [`RawModelSource`], validated on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawModelSource", into = "RawModelSource")]
pub enum ModelSource {
    HuggingFace {
        repo_id: String,
        filename: Option<String>,
    },
    OllamaLibrary {
        model_name: String,
    },
    ModelScope {
        model_id: String,
        file_path: Option<String>,
    },
    LocalPath {
        path: String,
    },
}

/// Source tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(rename = "huggingface")]
    HuggingFace,
    OllamaLibrary,
    ModelScope,
    LocalPath,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::HuggingFace => write!(f, "huggingface"),
            SourceKind::OllamaLibrary => write!(f, "ollama_library"),
            SourceKind::ModelScope => write!(f, "model_scope"),
            SourceKind::LocalPath => write!(f, "local_path"),
        }
    }
}

/// Flat wire representation of a model source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawModelSource {
    pub source: Option<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_library_model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_scope_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_scope_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

fn required(value: Option<String>, field: &str, kind: SourceKind) -> FleetResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(FleetError::Validation(format!(
            "{} must be provided when source is '{}'",
            field, kind
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<RawModelSource> for ModelSource {
    type Error = FleetError;

    fn try_from(raw: RawModelSource) -> FleetResult<Self> {
        let kind = raw
            .source
            .ok_or_else(|| FleetError::Validation("source must be provided".to_string()))?;

        match kind {
            SourceKind::HuggingFace => Ok(ModelSource::HuggingFace {
                repo_id: required(raw.huggingface_repo_id, "huggingface_repo_id", kind)?,
                filename: non_empty(raw.huggingface_filename),
            }),
            SourceKind::OllamaLibrary => Ok(ModelSource::OllamaLibrary {
                model_name: required(
                    raw.ollama_library_model_name,
                    "ollama_library_model_name",
                    kind,
                )?,
            }),
            SourceKind::ModelScope => Ok(ModelSource::ModelScope {
                model_id: required(raw.model_scope_model_id, "model_scope_model_id", kind)?,
                file_path: non_empty(raw.model_scope_file_path),
            }),
            SourceKind::LocalPath => Ok(ModelSource::LocalPath {
                path: required(raw.local_path, "local_path", kind)?,
            }),
        }
    }
}

impl From<ModelSource> for RawModelSource {
    fn from(source: ModelSource) -> Self {
        let mut raw = RawModelSource {
            source: Some(source.kind()),
            ..Default::default()
        };
        match source {
            ModelSource::HuggingFace { repo_id, filename } => {
                raw.huggingface_repo_id = Some(repo_id);
                raw.huggingface_filename = filename;
            }
            ModelSource::OllamaLibrary { model_name } => {
                raw.ollama_library_model_name = Some(model_name);
            }
            ModelSource::ModelScope { model_id, file_path } => {
                raw.model_scope_model_id = Some(model_id);
                raw.model_scope_file_path = file_path;
            }
            ModelSource::LocalPath { path } => {
                raw.local_path = Some(path);
            }
        }
        raw
    }
}

impl ModelSource {
    pub fn huggingface(repo_id: &str, filename: Option<&str>) -> FleetResult<Self> {
        RawModelSource {
            source: Some(SourceKind::HuggingFace),
            huggingface_repo_id: Some(repo_id.to_string()),
            huggingface_filename: filename.map(str::to_string),
            ..Default::default()
        }
        .try_into()
    }

    pub fn ollama(model_name: &str) -> FleetResult<Self> {
        RawModelSource {
            source: Some(SourceKind::OllamaLibrary),
            ollama_library_model_name: Some(model_name.to_string()),
            ..Default::default()
        }
        .try_into()
    }

    pub fn model_scope(model_id: &str, file_path: Option<&str>) -> FleetResult<Self> {
        RawModelSource {
            source: Some(SourceKind::ModelScope),
            model_scope_model_id: Some(model_id.to_string()),
            model_scope_file_path: file_path.map(str::to_string),
            ..Default::default()
        }
        .try_into()
    }

    pub fn local_path(path: &str) -> FleetResult<Self> {
        RawModelSource {
            source: Some(SourceKind::LocalPath),
            local_path: Some(path.to_string()),
            ..Default::default()
        }
        .try_into()
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            ModelSource::HuggingFace { .. } => SourceKind::HuggingFace,
            ModelSource::OllamaLibrary { .. } => SourceKind::OllamaLibrary,
            ModelSource::ModelScope { .. } => SourceKind::ModelScope,
            ModelSource::LocalPath { .. } => SourceKind::LocalPath,
        }
    }

    /// Identity of the model independent of quantization (file choice)
    pub fn source_key(&self) -> &str {
        match self {
            ModelSource::HuggingFace { repo_id, .. } => repo_id,
            ModelSource::OllamaLibrary { model_name } => model_name,
            ModelSource::ModelScope { model_id, .. } => model_id,
            ModelSource::LocalPath { path } => path,
        }
    }

    /// Human readable form, e.g. `Qwen/Qwen2-0.5B-Instruct-GGUF/qwen2-q4_0.gguf`
    pub fn readable_source(&self) -> String {
        match self {
            ModelSource::HuggingFace { repo_id, filename } => match filename {
                Some(f) => format!("{}/{}", repo_id, f),
                None => repo_id.clone(),
            },
            ModelSource::OllamaLibrary { model_name } => model_name.clone(),
            ModelSource::ModelScope { model_id, file_path } => match file_path {
                Some(f) => format!("{}/{}", model_id, f),
                None => model_id.clone(),
            },
            ModelSource::LocalPath { path } => path.clone(),
        }
    }

    /// SHA-256 of the readable source, hex encoded
    pub fn source_index(&self) -> String {
        hex::encode(Sha256::digest(self.readable_source().as_bytes()))
    }

    /// The single file (or path) the source points at, when it names one
    pub fn file_name(&self) -> Option<&str> {
        match self {
            ModelSource::HuggingFace { filename, .. } => filename.as_deref(),
            ModelSource::ModelScope { file_path, .. } => file_path.as_deref(),
            ModelSource::LocalPath { path } => Some(path),
            ModelSource::OllamaLibrary { .. } => None,
        }
    }
}

/// Model categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Llm,
    Embedding,
    Image,
    Reranker,
    SpeechToText,
    TextToSpeech,
    Unknown,
}

/// How replicas are distributed across workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    /// Use as many distinct workers as possible
    #[default]
    Spread,
    /// Fill a worker before using the next
    Binpack,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementPolicy::Spread => write!(f, "spread"),
            PlacementPolicy::Binpack => write!(f, "binpack"),
        }
    }
}

/// Explicit GPU pinning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSelector {
    /// Each element is `worker_name:device:gpu_index`, e.g. `worker1:cuda:0`
    #[serde(default)]
    pub gpu_ids: Vec<String>,
}

/// A parsed element of [`GpuSelector::gpu_ids`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectedGpu {
    pub worker_name: String,
    pub device: String,
    pub index: u32,
}

impl GpuSelector {
    /// Parse every id; the same GPU may be named only once
    pub fn parse(&self) -> FleetResult<Vec<SelectedGpu>> {
        let mut seen = std::collections::HashSet::new();
        self.gpu_ids
            .iter()
            .map(|id| {
                let parts: Vec<&str> = id.rsplitn(3, ':').collect();
                let [index, device, worker_name] = parts.as_slice() else {
                    return Err(FleetError::Validation(format!(
                        "invalid gpu id '{}', expected worker_name:device:gpu_index",
                        id
                    )));
                };
                let index = index.parse::<u32>().map_err(|_| {
                    FleetError::Validation(format!("invalid gpu index in '{}'", id))
                })?;
                let gpu = SelectedGpu {
                    worker_name: worker_name.to_string(),
                    device: device.to_string(),
                    index,
                };
                if !seen.insert((gpu.worker_name.clone(), gpu.index)) {
                    return Err(FleetError::Validation(format!(
                        "gpu id '{}' selects a GPU already listed",
                        id
                    )));
                }
                Ok(gpu)
            })
            .collect()
    }
}

fn default_replicas() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// A user-declared model serving request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Unique name
    pub name: String,
    #[serde(flatten)]
    pub source: ModelSource,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form metadata, also carries footprint hints (`vram`, `ram`, `layers`)
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Observed replicas in `running`
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub placement_strategy: PlacementPolicy,
    #[serde(default)]
    pub cpu_offloading: Option<bool>,
    #[serde(default)]
    pub distributed_inference_across_workers: Option<bool>,
    /// Labels a worker must carry
    #[serde(default)]
    pub worker_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_selector: Option<GpuSelector>,
    #[serde(default)]
    pub backend: Option<Backend>,
    #[serde(default)]
    pub backend_version: Option<String>,
    #[serde(default)]
    pub backend_parameters: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub restart_on_error: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ModelSpec {
    /// Create a new spec with default values
    pub fn new(name: impl Into<String>, source: ModelSource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source,
            description: None,
            meta: HashMap::new(),
            replicas: 1,
            ready_replicas: 0,
            categories: Vec::new(),
            placement_strategy: PlacementPolicy::Spread,
            cpu_offloading: None,
            distributed_inference_across_workers: None,
            worker_selector: BTreeMap::new(),
            gpu_selector: None,
            backend: None,
            backend_version: None,
            backend_parameters: Vec::new(),
            env: BTreeMap::new(),
            restart_on_error: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// The backend that serves this spec
    pub fn resolved_backend(&self) -> Backend {
        backend::resolve_backend(self)
    }

    pub fn is_gguf(&self) -> bool {
        backend::is_gguf_model(&self.source, self.backend.as_ref())
    }

    pub fn is_audio(&self) -> bool {
        backend::is_audio_model(self.backend.as_ref(), &self.categories)
    }

    pub fn is_image(&self) -> bool {
        self.categories.contains(&Category::Image)
    }

    pub fn is_embedding(&self) -> bool {
        self.categories.contains(&Category::Embedding)
    }

    pub fn is_reranker(&self) -> bool {
        self.categories.contains(&Category::Reranker)
    }

    pub fn cpu_offloading(&self) -> bool {
        self.cpu_offloading.unwrap_or(false)
    }

    pub fn distributed_inference(&self) -> bool {
        self.distributed_inference_across_workers.unwrap_or(false)
    }

    /// Whether the resolved backend can span several workers at all
    pub fn distributable(&self) -> bool {
        self.resolved_backend().supports_distributed()
    }
}

/// Partial update of a [`ModelSpec`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSpecPatch {
    pub name: Option<String>,
    pub source: Option<ModelSource>,
    pub description: Option<String>,
    pub meta: Option<HashMap<String, serde_json::Value>>,
    pub replicas: Option<u32>,
    pub categories: Option<Vec<Category>>,
    pub placement_strategy: Option<PlacementPolicy>,
    pub cpu_offloading: Option<bool>,
    pub distributed_inference_across_workers: Option<bool>,
    pub worker_selector: Option<BTreeMap<String, String>>,
    pub gpu_selector: Option<GpuSelector>,
    pub backend: Option<Backend>,
    pub backend_version: Option<String>,
    pub backend_parameters: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub restart_on_error: Option<bool>,
}

/// What a patch changed, used to decide how to reconcile afterwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchEffect {
    pub replicas_changed: bool,
    /// Existing placements are no longer valid
    pub placement_changed: bool,
}

impl ModelSpecPatch {
    /// Apply onto `spec`. Flags that were defaulted from the old backend are
    /// cleared when the backend resolution may change, so that defaults are
    /// recomputed against the new one.
    pub fn apply(self, spec: &mut ModelSpec) -> PatchEffect {
        let mut effect = PatchEffect::default();
        let old_backend = spec.resolved_backend();

        if let Some(name) = self.name {
            spec.name = name;
        }
        if let Some(source) = self.source {
            effect.placement_changed |= source != spec.source;
            spec.source = source;
        }
        if let Some(description) = self.description {
            spec.description = Some(description);
        }
        if let Some(meta) = self.meta {
            effect.placement_changed |= meta != spec.meta;
            spec.meta = meta;
        }
        if let Some(replicas) = self.replicas {
            effect.replicas_changed = replicas != spec.replicas;
            spec.replicas = replicas;
        }
        if let Some(categories) = self.categories {
            spec.categories = categories;
        }
        if let Some(strategy) = self.placement_strategy {
            effect.placement_changed |= strategy != spec.placement_strategy;
            spec.placement_strategy = strategy;
        }
        if let Some(selector) = self.worker_selector {
            effect.placement_changed |= selector != spec.worker_selector;
            spec.worker_selector = selector;
        }
        if let Some(selector) = self.gpu_selector {
            effect.placement_changed |= spec.gpu_selector.as_ref() != Some(&selector);
            spec.gpu_selector = Some(selector);
        }
        if let Some(backend) = self.backend {
            effect.placement_changed |= spec.backend.as_ref() != Some(&backend);
            spec.backend = Some(backend);
        }
        if let Some(version) = self.backend_version {
            spec.backend_version = Some(version);
        }
        if let Some(params) = self.backend_parameters {
            effect.placement_changed |= params != spec.backend_parameters;
            spec.backend_parameters = params;
        }
        if let Some(env) = self.env {
            spec.env = env;
        }
        if let Some(restart) = self.restart_on_error {
            spec.restart_on_error = restart;
        }

        let backend_changed = spec.resolved_backend() != old_backend;
        match self.cpu_offloading {
            Some(v) => {
                effect.placement_changed |= spec.cpu_offloading != Some(v);
                spec.cpu_offloading = Some(v);
            }
            None if backend_changed => spec.cpu_offloading = None,
            None => {}
        }
        match self.distributed_inference_across_workers {
            Some(v) => {
                effect.placement_changed |= spec.distributed_inference_across_workers != Some(v);
                spec.distributed_inference_across_workers = Some(v);
            }
            None if backend_changed => spec.distributed_inference_across_workers = None,
            None => {}
        }
        effect.placement_changed |= backend_changed;

        spec.updated_at = Utc::now();
        effect
    }
}
