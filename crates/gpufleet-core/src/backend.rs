//! Backend resolution and backend-specific spec validation

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::model::{Category, ModelSource, ModelSpec};

/// Serving backend identity.
///
/// Known backends get their own variant; anything else is kept verbatim so
/// that an explicitly declared backend always round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Backend {
    /// GGUF-oriented backend (llama.cpp based)
    LlamaBox,
    /// General tensor-serving backend
    Vllm,
    /// Speech-to-text / text-to-speech backend
    VoxBox,
    /// Ascend NPU backend
    AscendMindie,
    /// Any other backend name
    Custom(String),
}

impl Backend {
    pub fn as_str(&self) -> &str {
        match self {
            Backend::LlamaBox => "llama-box",
            Backend::Vllm => "vllm",
            Backend::VoxBox => "vox-box",
            Backend::AscendMindie => "ascend-mindie",
            Backend::Custom(name) => name,
        }
    }

    /// Whether one instance may span several workers
    pub fn supports_distributed(&self) -> bool {
        matches!(
            self,
            Backend::LlamaBox | Backend::Vllm | Backend::AscendMindie
        )
    }

    /// Default for `distributed_inference_across_workers` when unset
    pub fn distributed_by_default(&self) -> bool {
        matches!(self, Backend::LlamaBox | Backend::Vllm)
    }

    /// Default for `cpu_offloading` when unset
    pub fn cpu_offloading_by_default(&self) -> bool {
        matches!(self, Backend::LlamaBox)
    }
}

impl From<String> for Backend {
    fn from(name: String) -> Self {
        match name.as_str() {
            "llama-box" => Backend::LlamaBox,
            "vllm" => Backend::Vllm,
            "vox-box" => Backend::VoxBox,
            "ascend-mindie" => Backend::AscendMindie,
            _ => Backend::Custom(name),
        }
    }
}

impl From<&str> for Backend {
    fn from(name: &str) -> Self {
        Backend::from(name.to_string())
    }
}

impl From<Backend> for String {
    fn from(backend: Backend) -> Self {
        backend.as_str().to_string()
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn ends_with_gguf(name: Option<&str>) -> bool {
    name.is_some_and(|n| n.ends_with(".gguf"))
}

/// GGUF detection.
///
/// `backend` is only available on a full spec; pass `None` when only a
/// source is at hand.
pub fn is_gguf_model(source: &ModelSource, backend: Option<&Backend>) -> bool {
    match source {
        ModelSource::OllamaLibrary { .. } => return true,
        ModelSource::HuggingFace { filename, .. } => {
            if ends_with_gguf(filename.as_deref()) {
                return true;
            }
        }
        ModelSource::ModelScope { file_path, .. } => {
            if ends_with_gguf(file_path.as_deref()) {
                return true;
            }
        }
        ModelSource::LocalPath { path } => {
            if ends_with_gguf(Some(path)) {
                return true;
            }
        }
    }
    backend == Some(&Backend::LlamaBox)
}

/// Speech-to-text or text-to-speech model
pub fn is_audio_model(backend: Option<&Backend>, categories: &[Category]) -> bool {
    backend == Some(&Backend::VoxBox)
        || categories
            .iter()
            .any(|c| matches!(c, Category::SpeechToText | Category::TextToSpeech))
}

/// Pick the backend that serves `spec`. First match wins: explicit backend,
/// GGUF model, audio model, then the general tensor-serving backend.
pub fn resolve_backend(spec: &ModelSpec) -> Backend {
    if let Some(backend) = &spec.backend {
        return backend.clone();
    }
    if is_gguf_model(&spec.source, None) {
        return Backend::LlamaBox;
    }
    if is_audio_model(None, &spec.categories) {
        return Backend::VoxBox;
    }
    Backend::Vllm
}

/// Fill unset flags from the resolved backend.
pub fn apply_defaults(spec: &mut ModelSpec) {
    let backend = resolve_backend(spec);
    if spec.cpu_offloading.is_none() {
        spec.cpu_offloading = Some(backend.cpu_offloading_by_default());
    }
    if spec.distributed_inference_across_workers.is_none() {
        spec.distributed_inference_across_workers = Some(backend.distributed_by_default());
    }
}

/// Whole-object validation, run after all fields (and defaults) are set.
pub fn validate_spec(spec: &ModelSpec) -> FleetResult<()> {
    if spec.name.trim().is_empty() {
        return Err(FleetError::Validation("name must not be empty".to_string()));
    }
    if let Some(selector) = &spec.gpu_selector {
        selector.parse()?;
    }

    match resolve_backend(spec) {
        Backend::LlamaBox => {
            if let ModelSource::HuggingFace { filename: None, .. } = &spec.source {
                return Err(FleetError::Validation(
                    "huggingface_filename must be provided when source is 'huggingface'"
                        .to_string(),
                ));
            }
        }
        Backend::Vllm | Backend::AscendMindie => {
            if spec.cpu_offloading() {
                return Err(FleetError::Validation(
                    "CPU offloading is only supported for GGUF models".to_string(),
                ));
            }
        }
        Backend::VoxBox => {
            if spec.distributed_inference() {
                return Err(FleetError::Validation(
                    "Distributed inference across workers is not supported for the vox-box backend"
                        .to_string(),
                ));
            }
        }
        Backend::Custom(_) => {}
    }
    Ok(())
}

/// Resolve defaults then validate, the entry point used on create and update.
pub fn prepare_spec(spec: &mut ModelSpec) -> FleetResult<Backend> {
    apply_defaults(spec);
    validate_spec(spec)?;
    Ok(resolve_backend(spec))
}

/// Look up a command-line style parameter in `parameters`.
///
/// Recognises `--name value`, `--name=value`, `-name value` and `-name=value`.
pub fn find_parameter<'a>(parameters: &'a [String], names: &[&str]) -> Option<&'a str> {
    let mut iter = parameters.iter();
    while let Some(param) = iter.next() {
        let stripped = param.trim_start_matches('-');
        if stripped.len() == param.len() {
            continue;
        }
        let (key, inline) = match stripped.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (stripped, None),
        };
        if names.contains(&key) {
            return match inline {
                Some(v) => Some(v),
                None => iter.next().map(String::as_str),
            };
        }
    }
    None
}

/// Multimodal projector file for GGUF models: the `--mmproj` parameter when it
/// is a bare filename, otherwise the default glob.
pub fn mmproj_filename(spec: &ModelSpec) -> Option<String> {
    if !spec.is_gguf() {
        return None;
    }
    if let Some(mmproj) = find_parameter(&spec.backend_parameters, &["mmproj"]) {
        let is_bare = std::path::Path::new(mmproj)
            .file_name()
            .is_some_and(|n| n == mmproj);
        if is_bare {
            return Some(mmproj.to_string());
        }
    }
    Some("*mmproj*.gguf".to_string())
}
