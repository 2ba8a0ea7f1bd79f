//! CLI commands implementation

use anyhow::{Context, Result};
use gpufleet_core::{prepare_spec, FleetConfig, ModelInstance, ModelSpec};
use gpufleet_scheduler::{CapacityLedger, Scheduler};
use gpufleet_store::Store;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const GIB: u64 = 1024 * 1024 * 1024;

/// Outcome of validating one declared model
#[derive(Debug)]
pub struct ValidatedModel {
    pub name: String,
    pub result: Result<ModelSpec, String>,
}

/// Instance row of a dry-run placement
#[derive(Debug, Serialize)]
pub struct PlannedInstance {
    pub model: String,
    pub instance: String,
    pub state: String,
    pub worker: Option<String>,
    pub gpus: Vec<u32>,
    pub vram: u64,
    pub offload_layers: Option<u32>,
    pub total_layers: Option<u32>,
    pub mode: Option<String>,
    pub subordinates: Vec<String>,
    pub message: Option<String>,
}

impl From<&ModelInstance> for PlannedInstance {
    fn from(instance: &ModelInstance) -> Self {
        let claim = instance.computed_resource_claim.as_ref();
        let servers = instance.distributed_servers.as_ref();
        Self {
            model: instance.model_name.clone(),
            instance: instance.name.clone(),
            state: instance.state.to_string(),
            worker: instance.worker_name.clone(),
            gpus: instance.gpu_indexes.clone(),
            vram: claim.map_or(0, |c| c.total_vram()),
            offload_layers: claim.and_then(|c| c.offload_layers),
            total_layers: claim.and_then(|c| c.total_layers),
            mode: servers.map(|s| s.mode.to_string()),
            subordinates: servers
                .map(|s| {
                    s.subordinate_workers
                        .iter()
                        .map(|w| w.worker_name.clone())
                        .collect()
                })
                .unwrap_or_default(),
            message: instance.state_message.clone(),
        }
    }
}

/// Result of a dry-run placement
#[derive(Debug, Default, Serialize)]
pub struct PlanReport {
    pub instances: Vec<PlannedInstance>,
    /// Models refused before placement, with the reason
    pub rejected: Vec<(String, String)>,
}

fn load(path: &Path) -> Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn gib(bytes: u64) -> String {
    format!("{:.1}Gi", bytes as f64 / GIB as f64)
}

/// Resolve and validate every model of a fleet file
pub fn validate_models(fleet: &FleetConfig) -> Vec<ValidatedModel> {
    fleet
        .models
        .iter()
        .cloned()
        .map(|mut spec| {
            let name = spec.name.clone();
            let result = prepare_spec(&mut spec)
                .map(|_| spec)
                .map_err(|e| e.to_string());
            ValidatedModel { name, result }
        })
        .collect()
}

/// Validate the models of a fleet file
pub fn validate(path: &Path) -> Result<()> {
    let fleet = load(path)?;
    let results = validate_models(&fleet);

    if results.is_empty() {
        println!("No models declared");
        return Ok(());
    }

    println!(
        "{:<24} {:<14} {:<10} {:<12} {:<10}",
        "NAME", "BACKEND", "OFFLOAD", "DISTRIBUTED", "STATUS"
    );
    println!("{}", "-".repeat(74));

    let mut failed = 0;
    for model in &results {
        match &model.result {
            Ok(spec) => println!(
                "{:<24} {:<14} {:<10} {:<12} {:<10}",
                model.name,
                spec.resolved_backend(),
                spec.cpu_offloading(),
                spec.distributed_inference(),
                "ok"
            ),
            Err(reason) => {
                failed += 1;
                println!("{:<24} {:<14} {:<10} {:<12} {}", model.name, "-", "-", "-", reason);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} models failed validation", failed, results.len());
    }
    Ok(())
}

/// Place every model of `fleet` on its workers without launching anything
pub async fn plan_fleet(fleet: FleetConfig) -> Result<PlanReport> {
    let store = Arc::new(Store::new());
    let ledger = Arc::new(CapacityLedger::from_workers(fleet.workers).await);
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        ledger,
        fleet.daemon.scheduler,
    ));

    let mut report = PlanReport::default();
    for spec in fleet.models {
        let name = spec.name.clone();
        match scheduler.create(spec).await {
            Ok(spec) => {
                scheduler.reconcile(spec.id).await?;
            }
            Err(e) => report.rejected.push((name, e.to_string())),
        }
    }

    let mut instances = store.list_instances().await;
    instances.sort_by(|a, b| a.model_name.cmp(&b.model_name).then(a.name.cmp(&b.name)));
    report.instances = instances.iter().map(PlannedInstance::from).collect();
    Ok(report)
}

/// Dry-run placement of a fleet file
pub async fn plan(path: &Path, json: bool) -> Result<()> {
    let report = plan_fleet(load(path)?).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.instances.is_empty() {
        println!("No instances planned");
    } else {
        println!(
            "{:<20} {:<28} {:<10} {:<14} {:<10} {:<10} {:<8}",
            "MODEL", "INSTANCE", "STATE", "WORKER", "GPUS", "VRAM", "LAYERS"
        );
        println!("{}", "-".repeat(110));
        for row in &report.instances {
            let layers = match (row.offload_layers, row.total_layers) {
                (Some(offload), Some(total)) => format!("{}/{}", offload, total),
                _ => "-".to_string(),
            };
            println!(
                "{:<20} {:<28} {:<10} {:<14} {:<10} {:<10} {:<8}",
                row.model,
                row.instance,
                row.state,
                row.worker.as_deref().unwrap_or("-"),
                format!("{:?}", row.gpus),
                gib(row.vram),
                layers
            );
            if let Some(mode) = &row.mode {
                println!("  {} with {}", mode, row.subordinates.join(", "));
            }
            if let Some(message) = &row.message {
                println!("  {}", message);
            }
        }
    }

    for (name, reason) in &report.rejected {
        eprintln!("Rejected '{}': {}", name, reason);
    }

    Ok(())
}

/// Show the worker inventory of a fleet file
pub async fn workers(path: &Path) -> Result<()> {
    let fleet = load(path)?;
    let ledger = CapacityLedger::from_workers(fleet.workers).await;
    let snapshot = ledger.snapshot().await;

    if snapshot.is_empty() {
        println!("No workers declared");
        return Ok(());
    }

    for entry in snapshot {
        let worker = &entry.worker;
        println!(
            "{} ({}) - {:?} - RAM {}/{}",
            worker.name,
            worker.ip,
            worker.state,
            gib(entry.allocatable.ram),
            gib(worker.memory.total)
        );
        for gpu in &worker.gpu_devices {
            let free = entry.allocatable.vram.get(&gpu.index).copied().unwrap_or(0);
            println!(
                "  [{}] {} ({}) - {}/{}",
                gpu.index,
                gpu.name,
                gpu.vendor,
                gib(free),
                gib(gpu.memory_total)
            );
        }
    }

    Ok(())
}
