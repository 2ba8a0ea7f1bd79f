//! Startup ordering for multi-worker instances

use gpufleet_core::{Backend, CoordinateMode, DistributedServers, SubordinateWorker};

use crate::placement::PlacementPlan;

/// Decides how the main worker and its subordinates start up.
///
/// The mode is fixed when the instance is placed and never changes afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedCoordinator;

impl DistributedCoordinator {
    /// Coordination mode for a backend. `RunFirst` is never chosen here; the
    /// lifecycle still honours it when an instance carries it.
    pub fn mode_for(&self, backend: &Backend) -> CoordinateMode {
        match backend {
            Backend::AscendMindie => CoordinateMode::InitializeLater,
            _ => CoordinateMode::Delegated,
        }
    }

    /// llama-box subordinates are RPC servers that receive tensors from the
    /// main worker and never read model files themselves.
    pub fn download_model_files(&self, backend: &Backend) -> bool {
        !matches!(backend, Backend::LlamaBox)
    }

    /// Distributed block for a placement, or `None` for a single worker
    pub fn servers_for(&self, backend: &Backend, plan: &PlacementPlan) -> Option<DistributedServers> {
        if !plan.is_distributed() {
            return None;
        }
        let subordinate_workers = plan
            .subordinates
            .iter()
            .map(|assignment| {
                let mut sub = SubordinateWorker::new(
                    assignment.worker_id,
                    assignment.worker_name.clone(),
                    assignment.worker_ip.clone(),
                );
                sub.gpu_indexes = assignment.gpu_indexes();
                sub.total_gpus = sub.gpu_indexes.len() as u32;
                sub.gpu_addresses = assignment.gpu_addresses.clone();
                sub.computed_resource_claim = assignment.claim.clone();
                sub
            })
            .collect();
        Some(DistributedServers {
            mode: self.mode_for(backend),
            download_model_files: self.download_model_files(backend),
            subordinate_workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::Assignment;
    use gpufleet_core::{InstanceState, ResourceClaim};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn assignment(name: &str) -> Assignment {
        Assignment {
            worker_id: Uuid::new_v4(),
            worker_name: name.to_string(),
            worker_ip: "10.0.0.1".to_string(),
            gpu_addresses: vec!["10.0.0.1:cuda:0".to_string()],
            claim: ResourceClaim {
                vram: BTreeMap::from([(0, 1 << 30)]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_mode_for_backend() {
        let c = DistributedCoordinator;
        assert_eq!(c.mode_for(&Backend::Vllm), CoordinateMode::Delegated);
        assert_eq!(c.mode_for(&Backend::LlamaBox), CoordinateMode::Delegated);
        assert_eq!(
            c.mode_for(&Backend::AscendMindie),
            CoordinateMode::InitializeLater
        );
        assert_eq!(
            c.mode_for(&Backend::Custom("sglang".to_string())),
            CoordinateMode::Delegated
        );
    }

    #[test]
    fn test_servers_for_single_worker() {
        let plan = PlacementPlan::single(assignment("w1"));
        assert!(DistributedCoordinator
            .servers_for(&Backend::Vllm, &plan)
            .is_none());
    }

    #[test]
    fn test_servers_for_distributed() {
        let plan = PlacementPlan {
            main: assignment("w1"),
            subordinates: vec![assignment("w2"), assignment("w3")],
        };
        let servers = DistributedCoordinator
            .servers_for(&Backend::LlamaBox, &plan)
            .unwrap();
        assert_eq!(servers.mode, CoordinateMode::Delegated);
        assert!(!servers.download_model_files);
        assert_eq!(servers.subordinate_workers.len(), 2);
        let sub = &servers.subordinate_workers[1];
        assert_eq!(sub.worker_name, "w3");
        assert_eq!(sub.gpu_indexes, vec![0]);
        assert_eq!(sub.state, InstanceState::Pending);
    }
}
