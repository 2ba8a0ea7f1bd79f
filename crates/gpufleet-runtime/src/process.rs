//! Process-based runtime implementation
//!
//! Backends run as direct OS processes on this host. Model files are fetched
//! into the local [`ModelFileCache`] and launched from there.

use async_trait::async_trait;
use gpufleet_core::{
    find_parameter, mmproj_filename, Backend, FleetError, FleetResult, ModelSource, RuntimeConfig,
};
use gpufleet_store::ModelFileCache;
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::analyze::{analyze_path, ModelAnalysis};
use crate::health::HealthChecker;
use crate::traits::{LaunchOutcome, LaunchRequest, Runtime, Target};

/// How long a backend gets to exit after SIGTERM
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Ray's default GCS port on the head node
const RAY_HEAD_PORT: u16 = 6379;

/// Model hub base URLs
#[derive(Debug, Clone)]
pub struct HubEndpoints {
    pub huggingface: String,
    pub model_scope: String,
}

impl Default for HubEndpoints {
    fn default() -> Self {
        Self {
            huggingface: "https://huggingface.co".to_string(),
            model_scope: "https://modelscope.cn".to_string(),
        }
    }
}

impl HubEndpoints {
    /// Download URL for a single-file source
    pub fn file_url(&self, source: &ModelSource) -> FleetResult<String> {
        match source {
            ModelSource::HuggingFace {
                repo_id,
                filename: Some(file),
            } => Ok(format!(
                "{}/{}/resolve/main/{}",
                self.huggingface.trim_end_matches('/'),
                repo_id,
                file
            )),
            ModelSource::ModelScope {
                model_id,
                file_path: Some(file),
            } => Ok(format!(
                "{}/models/{}/resolve/master/{}",
                self.model_scope.trim_end_matches('/'),
                model_id,
                file
            )),
            ModelSource::HuggingFace { .. } | ModelSource::ModelScope { .. } => {
                Err(FleetError::Runtime(format!(
                    "{} names a whole repository; the process runtime only downloads single files",
                    source.readable_source()
                )))
            }
            ModelSource::OllamaLibrary { model_name } => Err(FleetError::Runtime(format!(
                "ollama library model {} cannot be pulled by the process runtime",
                model_name
            ))),
            ModelSource::LocalPath { path } => Err(FleetError::Runtime(format!(
                "local path {} does not exist",
                path
            ))),
        }
    }
}

/// A fully resolved backend command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    fn into_command(self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[derive(Debug)]
struct PortPool {
    base: u16,
    max: u16,
    used: BTreeSet<u16>,
    by_pid: HashMap<u32, Vec<u16>>,
}

impl PortPool {
    fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max,
            used: BTreeSet::new(),
            by_pid: HashMap::new(),
        }
    }

    fn allocate(&mut self, count: usize) -> FleetResult<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for offset in 0..self.max {
            if ports.len() == count {
                break;
            }
            let Some(port) = self.base.checked_add(offset) else {
                break;
            };
            if !self.used.contains(&port) {
                ports.push(port);
            }
        }
        if ports.len() < count {
            return Err(FleetError::Runtime(format!(
                "no free ports left in {}..{}",
                self.base,
                self.base.saturating_add(self.max)
            )));
        }
        self.used.extend(ports.iter().copied());
        Ok(ports)
    }

    fn assign(&mut self, pid: u32, ports: Vec<u16>) {
        self.by_pid.insert(pid, ports);
    }

    fn release(&mut self, ports: &[u16]) {
        for port in ports {
            self.used.remove(port);
        }
    }

    fn release_pid(&mut self, pid: u32) {
        if let Some(ports) = self.by_pid.remove(&pid) {
            self.release(&ports);
        }
    }
}

/// Process-based runtime for backend servers
pub struct ProcessRuntime {
    config: RuntimeConfig,
    cache: Arc<ModelFileCache>,
    endpoints: HubEndpoints,
    client: reqwest::Client,
    health: HealthChecker,
    children: Mutex<HashMap<u32, Child>>,
    ports: Mutex<PortPool>,
}

impl ProcessRuntime {
    pub fn new(config: RuntimeConfig, cache: Arc<ModelFileCache>, health: HealthChecker) -> Self {
        let ports = PortPool::new(config.worker_base_port, config.max_ports);
        Self {
            config,
            cache,
            endpoints: HubEndpoints::default(),
            client: reqwest::Client::new(),
            health,
            children: Mutex::new(HashMap::new()),
            ports: Mutex::new(ports),
        }
    }

    pub fn with_endpoints(mut self, endpoints: HubEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    async fn fetch(
        &self,
        source: &ModelSource,
        url: &str,
        progress: &mpsc::Sender<f64>,
    ) -> FleetResult<PathBuf> {
        let target = self.cache.target_path(source);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = OsString::from(target.as_os_str());
        partial.push(".part");
        let partial = PathBuf::from(partial);

        info!(url = %url, path = %target.display(), "Downloading model file");
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FleetError::Runtime(format!("download of {} failed: {}", url, e)))?;
        let total = response.content_length().filter(|t| *t > 0);

        let partial = PartialFile::new(partial);
        let mut file = tokio::fs::File::create(&partial.path).await?;
        let mut downloaded: u64 = 0;
        let mut reported = 0.0;
        let _ = progress.send(0.0).await;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FleetError::Runtime(format!("download of {} failed: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                let fraction = (downloaded as f64 / total as f64).min(1.0);
                if fraction - reported >= 0.01 {
                    reported = fraction;
                    let _ = progress.send(fraction).await;
                }
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial.path, &target).await?;
        partial.complete();
        self.cache.register(source, target.clone(), downloaded).await?;
        let _ = progress.send(1.0).await;
        info!(path = %target.display(), bytes = downloaded, "Model file downloaded");
        Ok(target)
    }
}

/// A download in progress; the file is removed unless the download completes
struct PartialFile {
    path: PathBuf,
    complete: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            complete: false,
        }
    }

    fn complete(mut self) {
        self.complete = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove partial download"
            ),
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn locate(&self, source: &ModelSource) -> FleetResult<Option<PathBuf>> {
        match source {
            ModelSource::LocalPath { path } => {
                let path = PathBuf::from(path);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Ok(Some(path))
                } else {
                    Err(FleetError::Runtime(format!(
                        "local path {} does not exist",
                        path.display()
                    )))
                }
            }
            ModelSource::OllamaLibrary { .. } => Ok(None),
            _ => {
                if let Some(path) = self.cache.resolve(source).await {
                    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                        return Ok(Some(path));
                    }
                }
                let target = self.cache.target_path(source);
                match tokio::fs::metadata(&target).await {
                    Ok(meta) => {
                        let size = if meta.is_file() { meta.len() } else { 0 };
                        self.cache.register(source, target.clone(), size).await?;
                        Ok(Some(target))
                    }
                    Err(_) => Ok(None),
                }
            }
        }
    }

    async fn download(
        &self,
        source: &ModelSource,
        progress: mpsc::Sender<f64>,
    ) -> FleetResult<PathBuf> {
        let url = self.endpoints.file_url(source)?;
        self.cache.init().await?;
        let result = self.fetch(source, &url, &progress).await;
        if let Err(e) = &result {
            warn!(source = %source.readable_source(), error = %e, "Model download failed");
        }
        result
    }

    async fn analyze(&self, path: &Path) -> FleetResult<ModelAnalysis> {
        analyze_path(path).await
    }

    async fn launch(&self, request: &LaunchRequest) -> FleetResult<LaunchOutcome> {
        let ports = self.ports.lock().await.allocate(1)?;

        let mmproj = match (request.target, &request.model_path) {
            (Target::Main, Some(path)) => resolve_mmproj(&request.spec, path).await,
            _ => None,
        };
        let command = match command_for(&self.config, request, ports[0], mmproj.as_deref()) {
            Ok(command) => command,
            Err(e) => {
                self.ports.lock().await.release(&ports);
                return Err(e);
            }
        };

        info!(
            instance = %request.instance.name,
            target = %request.target,
            program = %command.program.display(),
            port = ports[0],
            "Starting backend process"
        );
        debug!(args = ?command.args, "Backend command line");

        let program = command.program.clone();
        match command.into_command().spawn() {
            Ok(child) => {
                let Some(pid) = child.id() else {
                    self.ports.lock().await.release(&ports);
                    return Err(FleetError::Runtime(format!(
                        "{} exited before reporting a pid",
                        program.display()
                    )));
                };
                self.children.lock().await.insert(pid, child);
                self.ports.lock().await.assign(pid, ports.clone());
                debug!(instance = %request.instance.name, pid = pid, "Backend process spawned");
                Ok(LaunchOutcome::Launched { pid, ports })
            }
            Err(e) => {
                self.ports.lock().await.release(&ports);
                error!(
                    instance = %request.instance.name,
                    program = %program.display(),
                    error = %e,
                    "Failed to spawn backend process"
                );
                Err(FleetError::Runtime(format!(
                    "Failed to spawn {}: {}",
                    program.display(),
                    e
                )))
            }
        }
    }

    async fn stop(&self, pid: u32) -> FleetResult<()> {
        let child = self.children.lock().await.remove(&pid);
        self.ports.lock().await.release_pid(pid);
        let Some(mut child) = child else {
            debug!(pid = pid, "No backend process to stop");
            return Ok(());
        };

        info!(pid = pid, "Stopping backend process");
        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .output()
                .await;
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = pid, status = %status, "Backend process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(pid = pid, "Backend process did not exit after SIGTERM, killing");
                child.kill().await?;
                Ok(())
            }
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&pid) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn is_healthy(&self, ip: &str, port: u16) -> bool {
        self.health.check(ip, port).await
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Build the command line for one process of an instance.
pub fn command_for(
    config: &RuntimeConfig,
    request: &LaunchRequest,
    port: u16,
    mmproj: Option<&Path>,
) -> FleetResult<LaunchCommand> {
    let spec = &request.spec;
    let instance = &request.instance;
    let backend = spec.resolved_backend();
    let subordinates = instance.subordinates();
    let ranks = 1 + subordinates.len();
    let world_size = (instance.gpu_indexes.len()
        + subordinates.iter().map(|s| s.gpu_indexes.len()).sum::<usize>())
    .max(1);
    let main_ip = instance.worker_ip.as_deref().unwrap_or("127.0.0.1");
    let port_arg = port.to_string();
    let ranks_arg = ranks.to_string();

    let (program, mut args, gpu_indexes) = match request.target {
        Target::Main => {
            let path = model_path(request)?;
            let mut args: Vec<String> = Vec::new();
            match &backend {
                Backend::LlamaBox => {
                    let claim = instance.computed_resource_claim.clone().unwrap_or_default();
                    args.extend(
                        [
                            "--host",
                            "0.0.0.0",
                            "--port",
                            port_arg.as_str(),
                            "--model",
                            path.as_str(),
                        ]
                        .map(String::from),
                    );
                    args.extend(["--alias".to_string(), spec.name.clone()]);
                    if let Some(layers) = claim.offload_layers {
                        let explicit = find_parameter(
                            &spec.backend_parameters,
                            &["gpu-layers", "ngl", "n-gpu-layers"],
                        );
                        if explicit.is_none() {
                            args.extend(["--gpu-layers".to_string(), layers.to_string()]);
                        }
                    }
                    if claim.tensor_split.len() > 1
                        && find_parameter(&spec.backend_parameters, &["tensor-split", "ts"])
                            .is_none()
                    {
                        let split: Vec<String> =
                            claim.tensor_split.iter().map(u64::to_string).collect();
                        args.extend(["--tensor-split".to_string(), split.join(",")]);
                    }
                    if !request.peers.is_empty() {
                        args.extend(["--rpc".to_string(), request.peers.join(",")]);
                    }
                    if let Some(mmproj) = mmproj {
                        args.extend(["--mmproj".to_string(), mmproj.display().to_string()]);
                    }
                }
                Backend::Vllm => {
                    args.extend(
                        [
                            "serve",
                            path.as_str(),
                            "--host",
                            "0.0.0.0",
                            "--port",
                            port_arg.as_str(),
                        ]
                        .map(String::from),
                    );
                    args.extend(["--served-model-name".to_string(), spec.name.clone()]);
                    if find_parameter(&spec.backend_parameters, &["tensor-parallel-size", "tp"])
                        .is_none()
                    {
                        let tp = instance.gpu_indexes.len().max(1);
                        args.extend(["--tensor-parallel-size".to_string(), tp.to_string()]);
                    }
                    if ranks > 1 {
                        args.extend(
                            [
                                "--pipeline-parallel-size",
                                ranks_arg.as_str(),
                                "--distributed-executor-backend",
                                "ray",
                            ]
                            .map(String::from),
                        );
                    }
                }
                Backend::VoxBox => {
                    args.extend(
                        [
                            "start",
                            "--host",
                            "0.0.0.0",
                            "--port",
                            port_arg.as_str(),
                            "--model",
                            path.as_str(),
                        ]
                        .map(String::from),
                    );
                }
                Backend::AscendMindie => {
                    args.extend(
                        ["--model", path.as_str(), "--port", port_arg.as_str()].map(String::from),
                    );
                    args.extend(["--world-size".to_string(), world_size.to_string()]);
                    if ranks > 1 {
                        args.extend(["--rank", "0", "--master-addr", main_ip].map(String::from));
                    }
                }
                Backend::Custom(_) => {
                    args.extend(
                        ["--model", path.as_str(), "--port", port_arg.as_str()].map(String::from),
                    );
                }
            }
            args.extend(passthrough_parameters(&spec.backend_parameters, mmproj.is_some()));
            (
                config.binary_for(&backend),
                args,
                instance.gpu_indexes.clone(),
            )
        }
        Target::Subordinate(index) => {
            let sub = subordinates.get(index).ok_or_else(|| {
                FleetError::not_found("Subordinate worker", format!("{}#{}", instance.name, index))
            })?;
            let (program, args) = match &backend {
                Backend::LlamaBox => (
                    config.binary_for(&backend),
                    [
                        "--rpc-server",
                        "--host",
                        "0.0.0.0",
                        "--port",
                        port_arg.as_str(),
                        "--main-gpu",
                        "0",
                    ]
                    .map(String::from)
                    .to_vec(),
                ),
                Backend::Vllm => (
                    config.binary_for(&Backend::Custom("ray".to_string())),
                    vec![
                        "start".to_string(),
                        "--block".to_string(),
                        format!("--address={}:{}", main_ip, RAY_HEAD_PORT),
                    ],
                ),
                Backend::AscendMindie => {
                    let path = model_path(request)?;
                    let rank = (index + 1).to_string();
                    let mut args: Vec<String> =
                        ["--model", path.as_str(), "--port", port_arg.as_str()]
                            .map(String::from)
                            .to_vec();
                    args.extend(["--world-size".to_string(), world_size.to_string()]);
                    args.extend(["--rank", rank.as_str(), "--master-addr", main_ip].map(String::from));
                    args.extend(passthrough_parameters(&spec.backend_parameters, false));
                    (config.binary_for(&backend), args)
                }
                other => {
                    return Err(FleetError::Runtime(format!(
                        "backend {} does not run across workers",
                        other
                    )))
                }
            };
            (program, args, sub.gpu_indexes.clone())
        }
    };

    let mut env: Vec<(String, String)> = spec
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !gpu_indexes.is_empty() {
        let visible = match backend {
            Backend::AscendMindie => "ASCEND_RT_VISIBLE_DEVICES",
            _ => "CUDA_VISIBLE_DEVICES",
        };
        let ids: Vec<String> = gpu_indexes.iter().map(u32::to_string).collect();
        env.push((visible.to_string(), ids.join(",")));
    }

    Ok(LaunchCommand { program, args, env })
}

fn model_path(request: &LaunchRequest) -> FleetResult<String> {
    request
        .model_path
        .as_ref()
        .map(|p| p.display().to_string())
        .ok_or_else(|| {
            FleetError::Runtime(format!(
                "no model files resolved for {} ({})",
                request.instance.name, request.target
            ))
        })
}

/// Backend parameters to append verbatim; a resolved `--mmproj` replaces the user's.
fn passthrough_parameters(parameters: &[String], drop_mmproj: bool) -> Vec<String> {
    if !drop_mmproj {
        return parameters.to_vec();
    }
    let mut out = Vec::with_capacity(parameters.len());
    let mut iter = parameters.iter();
    while let Some(param) = iter.next() {
        let key = param.trim_start_matches('-');
        if key.len() != param.len() {
            if key == "mmproj" {
                iter.next();
                continue;
            }
            if key.starts_with("mmproj=") {
                continue;
            }
        }
        out.push(param.clone());
    }
    out
}

/// Multimodal projector next to the model files, if any
pub async fn resolve_mmproj(spec: &gpufleet_core::ModelSpec, model_path: &Path) -> Option<PathBuf> {
    let pattern = mmproj_filename(spec)?;
    let dir = if tokio::fs::metadata(model_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        model_path.to_path_buf()
    } else {
        model_path.parent()?.to_path_buf()
    };

    let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if glob_match(&pattern, name) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    matches.into_iter().next()
}

/// `*` wildcard matching on file names
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if name.len() < first.len() + last.len() || !name.starts_with(first) || !name.ends_with(last) {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_core::{
        CoordinateMode, DistributedServers, ModelInstance, ModelSpec, ResourceClaim,
        SubordinateWorker,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn gguf_spec() -> ModelSpec {
        ModelSpec::new(
            "qwen2",
            ModelSource::huggingface("Qwen/Qwen2-0.5B-Instruct-GGUF", Some("qwen2-q4_0.gguf"))
                .unwrap(),
        )
    }

    fn placed(spec: &ModelSpec, gpus: &[u32]) -> ModelInstance {
        let mut instance = ModelInstance::new(spec, "qwen2-a1b2c3".to_string());
        instance.worker_id = Some(Uuid::new_v4());
        instance.worker_ip = Some("10.0.0.1".to_string());
        instance.gpu_indexes = gpus.to_vec();
        instance.computed_resource_claim = Some(ResourceClaim {
            vram: gpus.iter().map(|g| (*g, 1 << 30)).collect::<BTreeMap<_, _>>(),
            ..Default::default()
        });
        instance
    }

    fn with_subordinate(mut instance: ModelInstance, mode: CoordinateMode) -> ModelInstance {
        let mut sub = SubordinateWorker::new(
            Uuid::new_v4(),
            "worker-2".to_string(),
            "10.0.0.2".to_string(),
        );
        sub.gpu_indexes = vec![1];
        instance.distributed_servers = Some(DistributedServers {
            mode,
            download_model_files: true,
            subordinate_workers: vec![sub],
        });
        instance
    }

    fn request(spec: ModelSpec, instance: ModelInstance, target: Target) -> LaunchRequest {
        LaunchRequest {
            instance,
            spec,
            target,
            model_path: Some(PathBuf::from("/models/qwen2-q4_0.gguf")),
            peers: Vec::new(),
        }
    }

    fn env_of<'a>(command: &'a LaunchCommand, key: &str) -> Option<&'a str> {
        command
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_llama_box_main_command() {
        let mut spec = gguf_spec();
        spec.backend_parameters = vec!["--ctx-size".to_string(), "8192".to_string()];
        spec.env.insert("LLAMA_ARG_THREADS".to_string(), "8".to_string());
        let mut instance = placed(&spec, &[0, 1]);
        if let Some(claim) = instance.computed_resource_claim.as_mut() {
            claim.offload_layers = Some(25);
            claim.tensor_split = vec![3, 1];
        }
        let mut req = request(spec, instance, Target::Main);
        req.peers = vec!["10.0.0.2:40000".to_string()];

        let cmd = command_for(&RuntimeConfig::default(), &req, 40001, None).unwrap();
        assert_eq!(cmd.program, PathBuf::from("llama-box"));
        let args = cmd.args.join(" ");
        assert!(args.contains("--port 40001"));
        assert!(args.contains("--model /models/qwen2-q4_0.gguf"));
        assert!(args.contains("--gpu-layers 25"));
        assert!(args.contains("--tensor-split 3,1"));
        assert!(args.contains("--rpc 10.0.0.2:40000"));
        assert!(args.ends_with("--ctx-size 8192"));
        assert_eq!(env_of(&cmd, "CUDA_VISIBLE_DEVICES"), Some("0,1"));
        assert_eq!(env_of(&cmd, "LLAMA_ARG_THREADS"), Some("8"));
    }

    #[test]
    fn test_explicit_parameters_win() {
        let mut spec = gguf_spec();
        spec.backend_parameters = vec!["--ngl=10".to_string(), "-ts".to_string(), "1,1".to_string()];
        let mut instance = placed(&spec, &[0, 1]);
        if let Some(claim) = instance.computed_resource_claim.as_mut() {
            claim.offload_layers = Some(25);
            claim.tensor_split = vec![3, 1];
        }
        let req = request(spec, instance, Target::Main);
        let cmd = command_for(&RuntimeConfig::default(), &req, 40000, None).unwrap();
        assert!(!cmd.args.iter().any(|a| a == "--gpu-layers"));
        assert!(!cmd.args.iter().any(|a| a == "--tensor-split"));
        assert!(cmd.args.iter().any(|a| a == "--ngl=10"));
    }

    #[test]
    fn test_resolved_mmproj_replaces_parameter() {
        let mut spec = gguf_spec();
        spec.backend_parameters = vec!["--mmproj".to_string(), "proj.gguf".to_string()];
        let instance = placed(&spec, &[0]);
        let req = request(spec, instance, Target::Main);
        let cmd = command_for(
            &RuntimeConfig::default(),
            &req,
            40000,
            Some(Path::new("/models/proj.gguf")),
        )
        .unwrap();
        let mmproj: Vec<_> = cmd.args.iter().filter(|a| *a == "--mmproj").collect();
        assert_eq!(mmproj.len(), 1);
        assert!(cmd.args.iter().any(|a| a == "/models/proj.gguf"));
        assert!(!cmd.args.iter().any(|a| a == "proj.gguf"));
    }

    #[test]
    fn test_llama_box_rpc_server() {
        let spec = gguf_spec();
        let instance = with_subordinate(placed(&spec, &[0]), CoordinateMode::Delegated);
        let mut req = request(spec, instance, Target::Subordinate(0));
        req.model_path = None;

        let cmd = command_for(&RuntimeConfig::default(), &req, 40002, None).unwrap();
        assert_eq!(
            cmd.args,
            ["--rpc-server", "--host", "0.0.0.0", "--port", "40002", "--main-gpu", "0"]
        );
        assert_eq!(env_of(&cmd, "CUDA_VISIBLE_DEVICES"), Some("1"));
    }

    #[test]
    fn test_vllm_distributed_commands() {
        let mut spec = ModelSpec::new(
            "qwen-chat",
            ModelSource::huggingface("Qwen/Qwen2-7B-Instruct", None).unwrap(),
        );
        spec.backend = Some(Backend::Vllm);
        let instance = with_subordinate(placed(&spec, &[0, 1]), CoordinateMode::Delegated);

        let main = request(spec.clone(), instance.clone(), Target::Main);
        let cmd = command_for(&RuntimeConfig::default(), &main, 40000, None).unwrap();
        assert_eq!(cmd.program, PathBuf::from("vllm"));
        assert_eq!(cmd.args[0], "serve");
        let args = cmd.args.join(" ");
        assert!(args.contains("--tensor-parallel-size 2"));
        assert!(args.contains("--pipeline-parallel-size 2"));

        let sub = request(spec, instance, Target::Subordinate(0));
        let cmd = command_for(&RuntimeConfig::default(), &sub, 40001, None).unwrap();
        assert_eq!(cmd.program, PathBuf::from("ray"));
        assert_eq!(cmd.args, ["start", "--block", "--address=10.0.0.1:6379"]);
    }

    #[test]
    fn test_ascend_visible_devices() {
        let mut spec = ModelSpec::new("mindie", ModelSource::local_path("/models/qwen").unwrap());
        spec.backend = Some(Backend::AscendMindie);
        let instance = with_subordinate(placed(&spec, &[2]), CoordinateMode::InitializeLater);
        let req = request(spec, instance, Target::Subordinate(0));

        let cmd = command_for(&RuntimeConfig::default(), &req, 40000, None).unwrap();
        let args = cmd.args.join(" ");
        assert!(args.contains("--world-size 2"));
        assert!(args.contains("--rank 1 --master-addr 10.0.0.1"));
        assert_eq!(env_of(&cmd, "ASCEND_RT_VISIBLE_DEVICES"), Some("1"));
        assert_eq!(env_of(&cmd, "CUDA_VISIBLE_DEVICES"), None);
    }

    #[test]
    fn test_main_needs_model_files() {
        let spec = gguf_spec();
        let instance = placed(&spec, &[0]);
        let mut req = request(spec, instance, Target::Main);
        req.model_path = None;
        assert!(matches!(
            command_for(&RuntimeConfig::default(), &req, 40000, None),
            Err(FleetError::Runtime(_))
        ));
    }

    #[test]
    fn test_vox_box_has_no_subordinates() {
        let mut spec = ModelSpec::new("whisper", ModelSource::local_path("/models/whisper").unwrap());
        spec.backend = Some(Backend::VoxBox);
        let instance = with_subordinate(placed(&spec, &[0]), CoordinateMode::Delegated);
        let req = request(spec, instance, Target::Subordinate(0));
        assert!(command_for(&RuntimeConfig::default(), &req, 40000, None).is_err());
    }

    #[test]
    fn test_port_pool() {
        let mut pool = PortPool::new(40000, 3);
        let a = pool.allocate(2).unwrap();
        assert_eq!(a, vec![40000, 40001]);
        pool.assign(100, a);
        assert_eq!(pool.allocate(1).unwrap(), vec![40002]);
        assert!(pool.allocate(1).is_err());

        pool.release_pid(100);
        assert_eq!(pool.allocate(2).unwrap(), vec![40000, 40001]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*mmproj*.gguf", "llava-mmproj-f16.gguf"));
        assert!(glob_match("*mmproj*.gguf", "mmproj.gguf"));
        assert!(!glob_match("*mmproj*.gguf", "llava-q4_0.gguf"));
        assert!(glob_match("proj.gguf", "proj.gguf"));
        assert!(!glob_match("proj.gguf", "proj.gguf.part"));
    }

    #[test]
    fn test_file_urls() {
        let endpoints = HubEndpoints::default();
        let hf = ModelSource::huggingface("Qwen/Qwen2-0.5B-Instruct-GGUF", Some("q4.gguf")).unwrap();
        assert_eq!(
            endpoints.file_url(&hf).unwrap(),
            "https://huggingface.co/Qwen/Qwen2-0.5B-Instruct-GGUF/resolve/main/q4.gguf"
        );
        let ms = ModelSource::model_scope("qwen/Qwen2-0.5B", Some("q4.gguf")).unwrap();
        assert_eq!(
            endpoints.file_url(&ms).unwrap(),
            "https://modelscope.cn/models/qwen/Qwen2-0.5B/resolve/master/q4.gguf"
        );
        assert!(endpoints
            .file_url(&ModelSource::ollama("llama3").unwrap())
            .is_err());
        assert!(endpoints
            .file_url(&ModelSource::huggingface("Qwen/Qwen2-7B", None).unwrap())
            .is_err());
    }

    fn runtime(dir: &TempDir) -> ProcessRuntime {
        let cache = Arc::new(ModelFileCache::new(dir.path().to_path_buf(), 1 << 30, true));
        ProcessRuntime::new(RuntimeConfig::default(), cache, HealthChecker::default())
    }

    #[tokio::test]
    async fn test_locate_local_path() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"GGUF").unwrap();
        let present = ModelSource::local_path(file.to_str().unwrap()).unwrap();
        assert_eq!(rt.locate(&present).await.unwrap(), Some(file));

        let missing = ModelSource::local_path("/nonexistent/model.gguf").unwrap();
        assert!(rt.locate(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_locate_finds_cached_file() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);
        let source = ModelSource::huggingface("Qwen/Qwen2-0.5B-Instruct-GGUF", Some("q4.gguf")).unwrap();
        assert_eq!(rt.locate(&source).await.unwrap(), None);

        let target = rt.cache.target_path(&source);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"GGUF").unwrap();
        assert_eq!(rt.locate(&source).await.unwrap(), Some(target));
        assert!(rt.cache.contains(&source).await);
    }

    #[tokio::test]
    async fn test_resolve_mmproj_in_model_dir() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("llava-q4_0.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        std::fs::write(dir.path().join("llava-mmproj-f16.gguf"), b"GGUF").unwrap();

        let spec = ModelSpec::new("llava", ModelSource::local_path(model.to_str().unwrap()).unwrap());
        assert_eq!(
            resolve_mmproj(&spec, &model).await,
            Some(dir.path().join("llava-mmproj-f16.gguf"))
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_ok() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);
        rt.stop(4_000_000).await.unwrap();
        assert!(!rt.is_alive(4_000_000).await);
    }

    /// Serves 10 of the 1000 bytes it announces, then closes or stalls
    async fn short_body_server(stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\n0123456789")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            if stall {
                std::future::pending::<()>().await;
            }
        });
        format!("http://{}/qwen2-q4_0.gguf", addr)
    }

    fn downloader(dir: &TempDir) -> ProcessRuntime {
        let cache = Arc::new(ModelFileCache::new(dir.path().to_path_buf(), 0, false));
        ProcessRuntime::new(RuntimeConfig::default(), cache, HealthChecker::new("/health", 1))
    }

    fn leftovers(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                found.extend(leftovers(&path));
            } else {
                found.push(path);
            }
        }
        found
    }

    #[tokio::test]
    async fn test_failed_download_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let runtime = downloader(&dir);
        let source = gguf_spec().source;
        let url = short_body_server(false).await;
        let (tx, _rx) = mpsc::channel(64);

        let result = runtime.fetch(&source, &url, &tx).await;
        assert!(result.is_err());
        assert!(leftovers(dir.path()).is_empty());
        assert!(runtime.cache.resolve(&source).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_download_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let runtime = downloader(&dir);
        let source = gguf_spec().source;
        let url = short_body_server(true).await;
        let (tx, mut rx) = mpsc::channel(64);

        let mut fetch = Box::pin(runtime.fetch(&source, &url, &tx));
        tokio::select! {
            _ = &mut fetch => panic!("download of a stalled body finished"),
            _ = rx.recv() => {}
        }
        let mut partial = OsString::from(runtime.cache.target_path(&source).as_os_str());
        partial.push(".part");
        assert!(Path::new(&partial).exists());

        drop(fetch);
        assert!(leftovers(dir.path()).is_empty());
    }
}
