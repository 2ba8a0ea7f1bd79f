//! Worker and GPU inventory as reported by workers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::memory_bytes;

/// A GPU device on a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index on its worker
    pub index: u32,
    /// Device name
    #[serde(default)]
    pub name: String,
    /// GPU vendor
    #[serde(default)]
    pub vendor: GpuVendor,
    /// Device type as used in GPU selectors (`cuda`, `npu`, `mps`, ...)
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Total memory in bytes
    #[serde(with = "memory_bytes")]
    pub memory_total: u64,
}

fn default_device_type() -> String {
    "cuda".to_string()
}

/// GPU vendor types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Huawei,
    #[default]
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Huawei => write!(f, "Huawei"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// System memory of a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(with = "memory_bytes")]
    pub total: u64,
    /// Apple silicon style shared CPU/GPU memory
    #[serde(default)]
    pub is_unified_memory: bool,
}

/// Resources held back from scheduling on a worker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemReserved {
    #[serde(default, with = "memory_bytes")]
    pub ram: u64,
    #[serde(default, with = "memory_bytes")]
    pub vram: u64,
}

/// Worker liveness as seen by the control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Ready,
    NotReady,
    Unreachable,
}

/// A GPU-equipped machine that hosts model instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: WorkerState,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub gpu_devices: Vec<GpuDevice>,
    #[serde(default)]
    pub system_reserved: SystemReserved,
}

impl Worker {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, memory_total: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ip: ip.into(),
            labels: BTreeMap::new(),
            state: WorkerState::Ready,
            memory: MemoryInfo {
                total: memory_total,
                is_unified_memory: false,
            },
            gpu_devices: Vec::new(),
            system_reserved: SystemReserved::default(),
        }
    }

    /// Builder-style helper used by inventories and tests
    pub fn with_gpu(mut self, memory_total: u64) -> Self {
        let index = self.gpu_devices.len() as u32;
        self.gpu_devices.push(GpuDevice {
            index,
            name: format!("GPU {}", index),
            vendor: GpuVendor::Nvidia,
            device_type: default_device_type(),
            memory_total,
        });
        self
    }

    pub fn is_schedulable(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Labels of this worker include every selector entry
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|l| l == v))
    }

    pub fn gpu(&self, index: u32) -> Option<&GpuDevice> {
        self.gpu_devices.iter().find(|g| g.index == index)
    }

    /// Address of a GPU as seen from other workers, e.g. `10.0.0.2:cuda:1`
    pub fn gpu_address(&self, index: u32) -> String {
        let device = self
            .gpu(index)
            .map(|g| g.device_type.as_str())
            .unwrap_or("cuda");
        format!("{}:{}:{}", self.ip, device, index)
    }
}
