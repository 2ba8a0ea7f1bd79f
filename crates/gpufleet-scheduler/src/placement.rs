//! Placement decisions
//!
//! A placement is computed in three passes over the ranked candidates, and
//! the first pass that produces a plan wins:
//! 1. the whole model in VRAM on one worker (one or more GPUs)
//! 2. partial CPU offload on one worker, when the spec allows offloading
//! 3. one main worker plus subordinate workers, when the spec is distributed

use gpufleet_core::{
    find_parameter, parse_memory, FleetError, FleetResult, ModelSpec, PlacementPolicy,
    ResourceClaim, SchedulerConfig, SelectedGpu, Worker,
};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::capacity::WorkerSnapshot;

/// Estimated footprint of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEstimate {
    /// Bytes of VRAM for the whole model
    pub vram: u64,
    /// Bytes of system memory needed besides any CPU-offloaded layers
    pub ram: u64,
    pub total_layers: u32,
}

/// Source of footprint estimates
pub trait ResourceEstimator: Send + Sync {
    fn estimate(&self, spec: &ModelSpec) -> FleetResult<ResourceEstimate>;
}

/// Reads `vram`, `ram` and `layers` hints from the spec's metadata and falls
/// back to configured defaults.
pub struct MetaEstimator {
    defaults: ResourceEstimate,
}

impl MetaEstimator {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            defaults: ResourceEstimate {
                vram: config.default_vram,
                ram: config.default_ram,
                total_layers: config.default_total_layers,
            },
        }
    }
}

fn meta_quantity(spec: &ModelSpec, key: &str) -> FleetResult<Option<u64>> {
    match spec.meta.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            FleetError::Validation(format!("meta.{} must be a non-negative integer", key))
        }),
        Some(serde_json::Value::String(s)) => parse_memory(s)
            .map(Some)
            .map_err(|e| FleetError::Validation(format!("meta.{}: {}", key, e))),
        Some(other) => Err(FleetError::Validation(format!(
            "meta.{} has unsupported value {}",
            key, other
        ))),
    }
}

impl ResourceEstimator for MetaEstimator {
    fn estimate(&self, spec: &ModelSpec) -> FleetResult<ResourceEstimate> {
        let layers = match meta_quantity(spec, "layers")? {
            Some(0) => {
                return Err(FleetError::Validation(
                    "meta.layers must be at least 1".to_string(),
                ))
            }
            Some(n) => u32::try_from(n)
                .map_err(|_| FleetError::Validation("meta.layers is too large".to_string()))?,
            None => self.defaults.total_layers.max(1),
        };
        Ok(ResourceEstimate {
            vram: meta_quantity(spec, "vram")?.unwrap_or(self.defaults.vram),
            ram: meta_quantity(spec, "ram")?.unwrap_or(self.defaults.ram),
            total_layers: layers,
        })
    }
}

/// Resources committed on one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: Uuid,
    pub worker_name: String,
    pub worker_ip: String,
    pub gpu_addresses: Vec<String>,
    pub claim: ResourceClaim,
}

impl Assignment {
    fn new(worker: &Worker, claim: ResourceClaim) -> Self {
        Self {
            worker_id: worker.id,
            worker_name: worker.name.clone(),
            worker_ip: worker.ip.clone(),
            gpu_addresses: claim
                .vram
                .keys()
                .map(|index| worker.gpu_address(*index))
                .collect(),
            claim,
        }
    }

    pub fn gpu_indexes(&self) -> Vec<u32> {
        self.claim.gpu_indexes()
    }
}

/// Where one replica goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPlan {
    pub main: Assignment,
    pub subordinates: Vec<Assignment>,
}

impl PlacementPlan {
    pub fn single(main: Assignment) -> Self {
        Self {
            main,
            subordinates: Vec::new(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        !self.subordinates.is_empty()
    }

    /// Every assignment with whether it is a subordinate one
    pub fn parts(&self) -> impl Iterator<Item = (&Assignment, bool)> {
        std::iter::once((&self.main, false)).chain(self.subordinates.iter().map(|s| (s, true)))
    }
}

/// A worker that passed the selectors, with the GPUs the spec may use on it
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub snapshot: &'a WorkerSnapshot,
    /// `(index, free bytes)`, most free first
    pub gpus: Vec<(u32, u64)>,
    /// GPUs were pinned by a GPU selector
    pub pinned: bool,
}

impl<'a> Candidate<'a> {
    fn new(snapshot: &'a WorkerSnapshot, selected: Option<&[SelectedGpu]>) -> Option<Self> {
        let mut gpus: Vec<(u32, u64)> = match selected {
            Some(selected) => {
                let mut gpus: Vec<(u32, u64)> = selected
                    .iter()
                    .filter(|s| s.worker_name == snapshot.worker.name)
                    .filter(|s| {
                        snapshot
                            .worker
                            .gpu(s.index)
                            .is_some_and(|gpu| gpu.device_type == s.device)
                    })
                    .filter_map(|s| {
                        snapshot
                            .allocatable
                            .vram
                            .get(&s.index)
                            .map(|free| (s.index, *free))
                    })
                    .collect();
                gpus.sort_unstable_by_key(|(index, _)| *index);
                gpus.dedup_by_key(|(index, _)| *index);
                if gpus.is_empty() {
                    return None;
                }
                gpus
            }
            None => snapshot
                .allocatable
                .vram
                .iter()
                .map(|(index, free)| (*index, *free))
                .collect(),
        };
        gpus.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Some(Self {
            snapshot,
            gpus,
            pinned: selected.is_some(),
        })
    }

    pub fn name(&self) -> &str {
        &self.snapshot.worker.name
    }

    pub fn free_vram(&self) -> u64 {
        self.gpus.iter().map(|(_, free)| free).sum()
    }

    pub fn free_ram(&self) -> u64 {
        self.snapshot.allocatable.ram
    }

    fn unified(&self) -> bool {
        self.snapshot.worker.memory.is_unified_memory
    }

    fn ram_fits(&self, ram: u64, vram: u64) -> bool {
        if self.unified() {
            ram.saturating_add(vram) <= self.free_ram()
        } else {
            ram <= self.free_ram()
        }
    }
}

/// Orders candidates for one replica of `model_id`
pub trait PlacementStrategy: Send + Sync {
    fn rank(&self, model_id: Uuid, candidates: &mut [Candidate<'_>]);
}

/// Prefer workers hosting the fewest replicas of the model, then the most free
pub struct Spread;

impl PlacementStrategy for Spread {
    fn rank(&self, model_id: Uuid, candidates: &mut [Candidate<'_>]) {
        candidates.sort_by(|a, b| {
            a.snapshot
                .replicas_of(model_id)
                .cmp(&b.snapshot.replicas_of(model_id))
                .then(b.free_vram().cmp(&a.free_vram()))
                .then(b.free_ram().cmp(&a.free_ram()))
                .then(a.name().cmp(b.name()))
        });
    }
}

/// Prefer the least free worker, so the first one that fits is filled up
pub struct Binpack;

impl PlacementStrategy for Binpack {
    fn rank(&self, _model_id: Uuid, candidates: &mut [Candidate<'_>]) {
        candidates.sort_by(|a, b| {
            a.free_vram()
                .cmp(&b.free_vram())
                .then(a.free_ram().cmp(&b.free_ram()))
                .then(a.name().cmp(b.name()))
        });
    }
}

pub fn strategy_for(policy: PlacementPolicy) -> &'static dyn PlacementStrategy {
    match policy {
        PlacementPolicy::Spread => &Spread,
        PlacementPolicy::Binpack => &Binpack,
    }
}

/// `--tensor-split 3,1` from the backend parameters, as integer weights
fn requested_tensor_split(spec: &ModelSpec) -> FleetResult<Option<Vec<u64>>> {
    let Some(raw) = find_parameter(&spec.backend_parameters, &["tensor-split", "ts"]) else {
        return Ok(None);
    };
    let weights = raw
        .split(',')
        .map(|w| {
            w.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| (v * 1_000_000.0).round() as u64)
                .ok_or_else(|| {
                    FleetError::Validation(format!("invalid --tensor-split value '{}'", raw))
                })
        })
        .collect::<FleetResult<Vec<u64>>>()?;
    if weights.iter().all(|w| *w == 0) {
        return Err(FleetError::Validation(format!(
            "--tensor-split '{}' has no positive weight",
            raw
        )));
    }
    Ok(Some(weights))
}

/// Split `total` across `weights` proportionally. When the weights are
/// capacities no share exceeds its weight.
fn split_proportional(total: u64, weights: &[(u32, u64)]) -> Vec<(u32, u64)> {
    let sum: u128 = weights.iter().map(|(_, w)| *w as u128).sum();
    if sum == 0 || weights.is_empty() {
        return weights.iter().map(|(index, _)| (*index, 0)).collect();
    }
    let mut shares: Vec<(u32, u64)> = weights
        .iter()
        .map(|(index, w)| (*index, (total as u128 * *w as u128 / sum) as u64))
        .collect();
    let mut rest = total - shares.iter().map(|(_, s)| s).sum::<u64>();
    for (k, (_, share)) in shares.iter_mut().enumerate() {
        if rest == 0 {
            break;
        }
        let add = weights[k].1.saturating_sub(*share).min(rest);
        *share += add;
        rest -= add;
    }
    if rest > 0 {
        shares[0].1 += rest;
    }
    shares
}

fn vram_map(shares: &[(u32, u64)]) -> BTreeMap<u32, u64> {
    shares
        .iter()
        .filter(|(_, bytes)| *bytes > 0)
        .map(|(index, bytes)| (*index, *bytes))
        .collect()
}

struct Planner<'a> {
    spec: &'a ModelSpec,
    estimate: ResourceEstimate,
    tensor_split: Option<Vec<u64>>,
}

impl<'a> Planner<'a> {
    fn claim(&self, candidate: &Candidate<'_>, ram: u64, vram: BTreeMap<u32, u64>, offload: u32) -> ResourceClaim {
        let tensor_split = if vram.len() > 1 {
            vram.values().copied().collect()
        } else {
            Vec::new()
        };
        ResourceClaim {
            is_unified_memory: candidate.unified(),
            offload_layers: Some(offload),
            total_layers: Some(self.estimate.total_layers),
            ram,
            vram,
            tensor_split,
        }
    }

    /// Whole model in VRAM on one worker
    fn fit_gpus(&self, candidate: &Candidate<'_>) -> Option<PlacementPlan> {
        let needed = self.estimate.vram;
        let ram = self.estimate.ram;
        let layers = self.estimate.total_layers;

        if needed == 0 {
            return candidate.ram_fits(ram, 0).then(|| {
                PlacementPlan::single(Assignment::new(
                    &candidate.snapshot.worker,
                    self.claim(candidate, ram, BTreeMap::new(), 0),
                ))
            });
        }

        let (chosen, weights): (Vec<(u32, u64)>, Vec<(u32, u64)>) = match &self.tensor_split {
            Some(split) => {
                if candidate.gpus.len() < split.len() {
                    return None;
                }
                let chosen = candidate.gpus[..split.len()].to_vec();
                let weights = chosen
                    .iter()
                    .zip(split)
                    .map(|((index, _), w)| (*index, *w))
                    .collect();
                (chosen, weights)
            }
            None if candidate.pinned => (candidate.gpus.clone(), candidate.gpus.clone()),
            None => {
                let mut sum = 0u64;
                let mut chosen = Vec::new();
                for gpu in &candidate.gpus {
                    if sum >= needed {
                        break;
                    }
                    sum += gpu.1;
                    chosen.push(*gpu);
                }
                (chosen.clone(), chosen)
            }
        };
        if chosen.is_empty() {
            return None;
        }

        let shares = split_proportional(needed, &weights);
        let fits = shares
            .iter()
            .zip(&chosen)
            .all(|((_, share), (_, free))| share <= free);
        if !fits || !candidate.ram_fits(ram, needed) {
            return None;
        }

        let mut claim = self.claim(candidate, ram, vram_map(&shares), layers);
        if let Some(split) = &self.tensor_split {
            if split.len() > 1 {
                claim.tensor_split = split.clone();
            }
        }
        Some(PlacementPlan::single(Assignment::new(
            &candidate.snapshot.worker,
            claim,
        )))
    }

    /// Part of the layers in VRAM, the rest in system memory
    fn fit_offload(&self, candidate: &Candidate<'_>) -> Option<PlacementPlan> {
        let layers = self.estimate.total_layers.max(1);
        let needed = self.estimate.vram;
        let per_layer = needed.div_ceil(layers as u64).max(1);

        let usable: Vec<(u32, u64)> = candidate
            .gpus
            .iter()
            .copied()
            .filter(|(_, free)| *free > 0)
            .collect();
        let free: u64 = usable.iter().map(|(_, f)| f).sum();
        let offload = ((free / per_layer).min(layers as u64)) as u32;
        let on_gpu = (per_layer * offload as u64).min(needed);
        let ram = self.estimate.ram.saturating_add(needed - on_gpu);

        if !candidate.ram_fits(ram, on_gpu) {
            return None;
        }
        let shares = if offload == 0 {
            Vec::new()
        } else {
            split_proportional(on_gpu, &usable)
        };
        Some(PlacementPlan::single(Assignment::new(
            &candidate.snapshot.worker,
            self.claim(candidate, ram, vram_map(&shares), offload),
        )))
    }

    /// A main worker plus as many subordinates as needed, in rank order
    fn fit_distributed(&self, candidates: &[Candidate<'_>]) -> Option<PlacementPlan> {
        let needed = self.estimate.vram;
        let layers = self.estimate.total_layers;

        for (i, main) in candidates.iter().enumerate() {
            if main.gpus.is_empty() || !main.ram_fits(self.estimate.ram, 0) {
                continue;
            }
            let mut ranks: Vec<&Candidate<'_>> = vec![main];
            let mut total = main.free_vram();
            for (j, other) in candidates.iter().enumerate() {
                if total >= needed {
                    break;
                }
                if j == i || other.free_vram() == 0 {
                    continue;
                }
                total += other.free_vram();
                ranks.push(other);
            }
            if total < needed || ranks.len() < 2 {
                continue;
            }

            let all_gpus: Vec<(u32, u64)> = ranks.iter().flat_map(|c| c.gpus.clone()).collect();
            let shares = split_proportional(needed, &all_gpus);
            let mut offset = 0;
            let mut per_rank: Vec<Vec<(u32, u64)>> = Vec::with_capacity(ranks.len());
            for rank in &ranks {
                per_rank.push(shares[offset..offset + rank.gpus.len()].to_vec());
                offset += rank.gpus.len();
            }

            let main_vram = vram_map(&per_rank[0]);
            let main_total: u64 = main_vram.values().sum();
            if !main.ram_fits(self.estimate.ram, main_total) {
                continue;
            }
            let tensor_split: Vec<u64> = shares
                .iter()
                .map(|(_, bytes)| *bytes)
                .filter(|bytes| *bytes > 0)
                .collect();

            let mut main_claim = self.claim(main, self.estimate.ram, main_vram, layers);
            main_claim.tensor_split = tensor_split;

            let subordinates = ranks[1..]
                .iter()
                .zip(&per_rank[1..])
                .map(|(rank, shares)| {
                    let vram = vram_map(shares);
                    Assignment::new(
                        &rank.snapshot.worker,
                        ResourceClaim {
                            is_unified_memory: rank.unified(),
                            ram: 0,
                            vram,
                            ..Default::default()
                        },
                    )
                })
                .collect();

            return Some(PlacementPlan {
                main: Assignment::new(&main.snapshot.worker, main_claim),
                subordinates,
            });
        }
        None
    }
}

/// Pick workers and GPUs for one replica of `spec`.
///
/// Fails with [`FleetError::Scheduling`] when nothing fits; the caller keeps
/// the instance pending and tries again on the next pass.
pub fn plan(
    spec: &ModelSpec,
    estimate: ResourceEstimate,
    workers: &[WorkerSnapshot],
) -> FleetResult<PlacementPlan> {
    let selected = spec.gpu_selector.as_ref().map(|s| s.parse()).transpose()?;
    let planner = Planner {
        spec,
        estimate,
        tensor_split: requested_tensor_split(spec)?,
    };

    let mut candidates: Vec<Candidate<'_>> = workers
        .iter()
        .filter(|w| w.worker.is_schedulable() && w.worker.matches_selector(&spec.worker_selector))
        .filter_map(|w| Candidate::new(w, selected.as_deref()))
        .collect();
    if candidates.is_empty() {
        return Err(FleetError::Scheduling(format!(
            "no ready worker matches the selectors of model {}",
            spec.name
        )));
    }
    strategy_for(spec.placement_strategy).rank(spec.id, &mut candidates);

    if let Some(plan) = candidates.iter().find_map(|c| planner.fit_gpus(c)) {
        return Ok(plan);
    }
    if planner.spec.cpu_offloading() {
        if let Some(plan) = candidates.iter().find_map(|c| planner.fit_offload(c)) {
            return Ok(plan);
        }
    }
    if planner.spec.distributed_inference() && planner.spec.distributable() {
        if let Some(plan) = planner.fit_distributed(&candidates) {
            return Ok(plan);
        }
    }

    Err(FleetError::Scheduling(format!(
        "no worker can hold model {} (vram {} bytes, ram {} bytes) among {} candidate(s)",
        spec.name,
        estimate.vram,
        estimate.ram,
        candidates.len()
    )))
}
