//! Model file analysis
//!
//! GGUF files carry their layer count in the metadata header
//! (`<arch>.block_count`), tensor checkpoints in `config.json`
//! (`num_hidden_layers`). Only the header is read; tensor data is never touched.

use gpufleet_core::{FleetError, FleetResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" in little-endian
const MAX_STRING_LEN: u64 = 1 << 24;

const GGUF_TYPE_UINT8: u32 = 0;
const GGUF_TYPE_INT8: u32 = 1;
const GGUF_TYPE_UINT16: u32 = 2;
const GGUF_TYPE_INT16: u32 = 3;
const GGUF_TYPE_UINT32: u32 = 4;
const GGUF_TYPE_INT32: u32 = 5;
const GGUF_TYPE_FLOAT32: u32 = 6;
const GGUF_TYPE_BOOL: u32 = 7;
const GGUF_TYPE_STRING: u32 = 8;
const GGUF_TYPE_ARRAY: u32 = 9;
const GGUF_TYPE_UINT64: u32 = 10;
const GGUF_TYPE_INT64: u32 = 11;
const GGUF_TYPE_FLOAT64: u32 = 12;

/// What analysis found out about a model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelAnalysis {
    pub architecture: Option<String>,
    /// Layers the backend can offload, including the output layer for GGUF
    pub total_layers: Option<u32>,
}

/// Analyze a model file or directory off the async runtime.
pub async fn analyze_path(path: &Path) -> FleetResult<ModelAnalysis> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || analyze_blocking(&path))
        .await
        .map_err(|e| FleetError::Internal(format!("analysis task failed: {}", e)))?
}

fn analyze_blocking(path: &Path) -> FleetResult<ModelAnalysis> {
    if path.is_dir() {
        let config = path.join("config.json");
        if config.is_file() {
            return read_config_json(&config);
        }
        if let Some(gguf) = first_gguf(path)? {
            return read_gguf_file(&gguf);
        }
        debug!(path = %path.display(), "Nothing to analyze");
        return Ok(ModelAnalysis::default());
    }
    if has_gguf_extension(path) {
        read_gguf_file(path)
    } else {
        Ok(ModelAnalysis::default())
    }
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
}

/// First model GGUF in a directory, ignoring multimodal projectors
fn first_gguf(dir: &Path) -> FleetResult<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| has_gguf_extension(p))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.contains("mmproj"))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[derive(Deserialize)]
struct CheckpointConfig {
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    num_hidden_layers: Option<u32>,
    /// Multimodal checkpoints nest the language model config
    #[serde(default)]
    text_config: Option<Box<CheckpointConfig>>,
}

fn read_config_json(path: &Path) -> FleetResult<ModelAnalysis> {
    let content = std::fs::read_to_string(path)?;
    let config: CheckpointConfig = serde_json::from_str(&content)?;
    let total_layers = config
        .num_hidden_layers
        .or_else(|| config.text_config.as_ref().and_then(|t| t.num_hidden_layers));
    Ok(ModelAnalysis {
        architecture: config.model_type,
        total_layers,
    })
}

fn read_gguf_file(path: &Path) -> FleetResult<ModelAnalysis> {
    let file = File::open(path)?;
    read_gguf(BufReader::new(file)).map_err(|e| match e {
        FleetError::Runtime(msg) => FleetError::Runtime(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

enum Value {
    Unsigned(u64),
    Signed(i64),
    Str(String),
    Other,
}

impl Value {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// Read the GGUF header until the architecture and its block count are known.
pub fn read_gguf<R: Read>(mut reader: R) -> FleetResult<ModelAnalysis> {
    let magic = read_u32(&mut reader)?;
    if magic != GGUF_MAGIC {
        return Err(FleetError::Runtime(format!(
            "not a GGUF file (magic: 0x{:08x})",
            magic
        )));
    }
    let version = read_u32(&mut reader)?;
    if !(2..=3).contains(&version) {
        return Err(FleetError::Runtime(format!(
            "unsupported GGUF version {}",
            version
        )));
    }
    let _tensor_count = read_u64(&mut reader)?;
    let kv_count = read_u64(&mut reader)?;

    let mut architecture: Option<String> = None;
    let mut block_counts: HashMap<String, u64> = HashMap::new();

    for _ in 0..kv_count {
        let key = read_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;
        let value = read_value(&mut reader, value_type)?;

        if key == "general.architecture" {
            if let Value::Str(arch) = value {
                architecture = Some(arch);
            }
        } else if let Some(prefix) = key.strip_suffix(".block_count") {
            if let Some(count) = value.as_u64() {
                block_counts.insert(prefix.to_string(), count);
            }
        }

        if let Some(arch) = &architecture {
            if block_counts.contains_key(arch) {
                break;
            }
        }
    }

    let total_layers = architecture
        .as_ref()
        .and_then(|arch| block_counts.get(arch))
        .map(|blocks| (*blocks as u32).saturating_add(1));
    Ok(ModelAnalysis {
        architecture,
        total_layers,
    })
}

fn read_value<R: Read>(reader: &mut R, value_type: u32) -> FleetResult<Value> {
    Ok(match value_type {
        GGUF_TYPE_UINT8 | GGUF_TYPE_BOOL => Value::Unsigned(read_array::<R, 1>(reader)?[0] as u64),
        GGUF_TYPE_INT8 => Value::Signed(read_array::<R, 1>(reader)?[0] as i8 as i64),
        GGUF_TYPE_UINT16 => Value::Unsigned(u16::from_le_bytes(read_array(reader)?) as u64),
        GGUF_TYPE_INT16 => Value::Signed(i16::from_le_bytes(read_array(reader)?) as i64),
        GGUF_TYPE_UINT32 => Value::Unsigned(read_u32(reader)? as u64),
        GGUF_TYPE_INT32 => Value::Signed(i32::from_le_bytes(read_array(reader)?) as i64),
        GGUF_TYPE_UINT64 => Value::Unsigned(read_u64(reader)?),
        GGUF_TYPE_INT64 => Value::Signed(i64::from_le_bytes(read_array(reader)?)),
        GGUF_TYPE_FLOAT32 => {
            read_array::<R, 4>(reader)?;
            Value::Other
        }
        GGUF_TYPE_FLOAT64 => {
            read_array::<R, 8>(reader)?;
            Value::Other
        }
        GGUF_TYPE_STRING => Value::Str(read_string(reader)?),
        GGUF_TYPE_ARRAY => {
            let elem_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            for _ in 0..len {
                read_value(reader, elem_type)?;
            }
            Value::Other
        }
        other => {
            return Err(FleetError::Runtime(format!(
                "unknown GGUF metadata type {}",
                other
            )))
        }
    })
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> FleetResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> FleetResult<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> FleetResult<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> FleetResult<String> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(FleetError::Runtime(format!(
            "GGUF string of {} bytes is too long",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| FleetError::Runtime(format!("invalid UTF-8 in GGUF string: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct GgufBuilder {
        kvs: Vec<u8>,
        count: u64,
    }

    impl GgufBuilder {
        fn string(buf: &mut Vec<u8>, s: &str) {
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }

        fn add_str(mut self, key: &str, value: &str) -> Self {
            Self::string(&mut self.kvs, key);
            self.kvs.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
            Self::string(&mut self.kvs, value);
            self.count += 1;
            self
        }

        fn add_u32(mut self, key: &str, value: u32) -> Self {
            Self::string(&mut self.kvs, key);
            self.kvs.extend_from_slice(&GGUF_TYPE_UINT32.to_le_bytes());
            self.kvs.extend_from_slice(&value.to_le_bytes());
            self.count += 1;
            self
        }

        fn add_tokens(mut self, key: &str, tokens: &[&str]) -> Self {
            Self::string(&mut self.kvs, key);
            self.kvs.extend_from_slice(&GGUF_TYPE_ARRAY.to_le_bytes());
            self.kvs.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
            self.kvs
                .extend_from_slice(&(tokens.len() as u64).to_le_bytes());
            for t in tokens {
                Self::string(&mut self.kvs, t);
            }
            self.count += 1;
            self
        }

        fn build(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
            out.extend_from_slice(&3u32.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&self.count.to_le_bytes());
            out.extend_from_slice(&self.kvs);
            out
        }
    }

    #[test]
    fn test_gguf_block_count() {
        let bytes = GgufBuilder::default()
            .add_str("general.architecture", "llama")
            .add_u32("llama.context_length", 4096)
            .add_tokens("tokenizer.ggml.tokens", &["<s>", "</s>", "hello"])
            .add_u32("llama.block_count", 32)
            .build();
        let analysis = read_gguf(bytes.as_slice()).unwrap();
        assert_eq!(analysis.architecture.as_deref(), Some("llama"));
        assert_eq!(analysis.total_layers, Some(33));
    }

    #[test]
    fn test_gguf_block_count_before_architecture() {
        let bytes = GgufBuilder::default()
            .add_u32("qwen2.block_count", 24)
            .add_str("general.architecture", "qwen2")
            .build();
        assert_eq!(read_gguf(bytes.as_slice()).unwrap().total_layers, Some(25));
    }

    #[test]
    fn test_gguf_rejects_bad_magic() {
        let bytes = b"NOPE\x03\x00\x00\x00".to_vec();
        assert!(matches!(
            read_gguf(bytes.as_slice()),
            Err(FleetError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn test_analyze_gguf_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model-q4_0.gguf");
        let bytes = GgufBuilder::default()
            .add_str("general.architecture", "llama")
            .add_u32("llama.block_count", 16)
            .build();
        std::fs::write(&path, bytes).unwrap();

        let analysis = analyze_path(&path).await.unwrap();
        assert_eq!(analysis.total_layers, Some(17));
    }

    #[tokio::test]
    async fn test_analyze_checkpoint_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "qwen2", "num_hidden_layers": 28, "hidden_size": 1536}"#,
        )
        .unwrap();

        let analysis = analyze_path(dir.path()).await.unwrap();
        assert_eq!(analysis.architecture.as_deref(), Some("qwen2"));
        assert_eq!(analysis.total_layers, Some(28));
    }

    #[tokio::test]
    async fn test_analyze_nested_text_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "llava", "text_config": {"num_hidden_layers": 32}}"#,
        )
        .unwrap();
        assert_eq!(
            analyze_path(dir.path()).await.unwrap().total_layers,
            Some(32)
        );
    }

    #[tokio::test]
    async fn test_analyze_dir_skips_mmproj() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a-mmproj-f16.gguf"), b"garbage").unwrap();
        let bytes = GgufBuilder::default()
            .add_str("general.architecture", "llama")
            .add_u32("llama.block_count", 40)
            .build();
        std::fs::write(dir.path().join("b-model.gguf"), bytes).unwrap();

        assert_eq!(
            analyze_path(dir.path()).await.unwrap().total_layers,
            Some(41)
        );
    }

    #[tokio::test]
    async fn test_analyze_unknown_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"{}").unwrap();
        assert_eq!(analyze_path(&path).await.unwrap(), ModelAnalysis::default());
    }
}
