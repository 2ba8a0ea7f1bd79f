//! Instance lifecycles
//!
//! Every placed instance is driven by one task: files are located or
//! downloaded, analyzed, the backend processes are launched in the order the
//! coordination mode demands, and the running instance is probed until it
//! fails, becomes unreachable or is removed. Failed instances are restarted
//! after a backoff when their spec allows it.
//!
//! Each task owns a lock that every write to its instance goes through,
//! including progress reports from collaborators, so the transitions of one
//! instance are applied strictly one after another.

use async_trait::async_trait;
use gpufleet_core::{
    Backend, CoordinateMode, FleetError, FleetResult, InstanceState, LifecycleConfig,
    ModelInstance, ModelSpec,
};
use gpufleet_scheduler::InstanceSupervisor;
use gpufleet_store::Store;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::traits::{LaunchOutcome, LaunchRequest, Runtime, Target};

/// Pause between readiness probes while an instance is starting
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// A field update pushed by a collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressReport {
    DownloadProgress(f64),
    Pid(u32),
    Ports(Vec<u16>),
    State {
        state: InstanceState,
        message: Option<String>,
    },
}

struct InstanceTask {
    lock: Arc<Mutex<()>>,
    cancel: watch::Sender<bool>,
    restart: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Runs one lifecycle task per placed instance
pub struct LifecycleManager {
    store: Arc<Store>,
    runtime: Arc<dyn Runtime>,
    config: LifecycleConfig,
    tasks: Mutex<HashMap<Uuid, InstanceTask>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<Store>, runtime: Arc<dyn Runtime>, config: LifecycleConfig) -> Self {
        Self {
            store,
            runtime,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start driving an instance. No-op while a task for it is alive.
    pub async fn supervise(&self, instance_id: Uuid) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(&instance_id) {
            if !task.handle.is_finished() {
                return;
            }
        }

        let lock = Arc::new(Mutex::new(()));
        let restart = Arc::new(Notify::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let driver = Driver {
            instance_id,
            store: Arc::clone(&self.store),
            runtime: Arc::clone(&self.runtime),
            config: self.config.clone(),
            lock: Arc::clone(&lock),
            cancel: cancel_rx,
            restart: Arc::clone(&restart),
            launched: Vec::new(),
        };
        let handle = tokio::spawn(driver.run());
        debug!(instance_id = %instance_id, "Supervising instance");
        tasks.insert(
            instance_id,
            InstanceTask {
                lock,
                cancel,
                restart,
                handle,
            },
        );
    }

    /// Apply a collaborator's report to an instance.
    ///
    /// Fails with `NotFound` when no lifecycle task owns the instance.
    pub async fn report_progress(
        &self,
        instance_id: Uuid,
        target: Target,
        report: ProgressReport,
    ) -> FleetResult<ModelInstance> {
        let lock = self
            .tasks
            .lock()
            .await
            .get(&instance_id)
            .map(|task| Arc::clone(&task.lock))
            .ok_or_else(|| FleetError::not_found("Instance lifecycle", instance_id))?;

        let _guard = lock.lock().await;
        let instance = self
            .store
            .update_instance(instance_id, move |i| apply_report(i, target, report))
            .await?;
        debug!(instance_id = %instance_id, target = %target, "Applied progress report");
        Ok(instance)
    }

    /// Operator restart of an `error` or `unreachable` instance.
    ///
    /// Restarting out of `error` is a no-op when the spec disables
    /// `restart_on_error`; the unchanged instance is returned.
    pub async fn restart_instance(&self, instance_id: Uuid) -> FleetResult<ModelInstance> {
        let before = self.store.get_instance(instance_id).await?;
        let spec = self.store.get_spec(before.model_id).await?;
        let restart_on_error = spec.restart_on_error;

        let existing = self
            .tasks
            .lock()
            .await
            .get(&instance_id)
            .filter(|task| !task.handle.is_finished())
            .map(|task| (Arc::clone(&task.lock), Arc::clone(&task.restart)));

        let after = match &existing {
            Some((lock, _)) => {
                let _guard = lock.lock().await;
                self.store
                    .update_instance(instance_id, |i| i.restart(restart_on_error).map(|_| ()))
                    .await?
            }
            None => {
                self.store
                    .update_instance(instance_id, |i| i.restart(restart_on_error).map(|_| ()))
                    .await?
            }
        };

        if after.restart_count == before.restart_count {
            info!(
                instance_id = %instance_id,
                state = %after.state,
                "Restart skipped, restart_on_error is disabled"
            );
            return Ok(after);
        }

        info!(
            instance_id = %instance_id,
            name = %after.name,
            restart_count = after.restart_count,
            "Restarting instance"
        );
        match existing {
            Some((_, restart)) => restart.notify_one(),
            None => self.supervise(instance_id).await,
        }
        Ok(after)
    }

    /// Cancel an instance's task and wait until its processes are stopped.
    pub async fn stop(&self, instance_id: Uuid) {
        let task = self.tasks.lock().await.remove(&instance_id);
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            if let Err(e) = task.handle.await {
                warn!(instance_id = %instance_id, error = %e, "Lifecycle task panicked");
            }
        }
    }

    /// Cancel every task
    pub async fn shutdown(&self) {
        let tasks: Vec<(Uuid, InstanceTask)> = self.tasks.lock().await.drain().collect();
        for (_, task) in &tasks {
            let _ = task.cancel.send(true);
        }
        for (instance_id, task) in tasks {
            if let Err(e) = task.handle.await {
                warn!(instance_id = %instance_id, error = %e, "Lifecycle task panicked");
            }
        }
        info!("Lifecycle manager stopped");
    }

    /// Number of instances with a live task
    pub async fn supervised(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }
}

#[async_trait]
impl InstanceSupervisor for LifecycleManager {
    async fn instance_placed(&self, instance: &ModelInstance) {
        self.supervise(instance.id).await;
    }

    async fn instance_removed(&self, instance: &ModelInstance) {
        self.stop(instance.id).await;
    }
}

fn apply_report(
    instance: &mut ModelInstance,
    target: Target,
    report: ProgressReport,
) -> FleetResult<()> {
    if let ProgressReport::DownloadProgress(p) = &report {
        if !(0.0..=1.0).contains(p) {
            return Err(FleetError::Validation(format!(
                "download progress {} is outside [0, 1]",
                p
            )));
        }
    }

    match target {
        Target::Main => match report {
            ProgressReport::DownloadProgress(p) => instance.download_progress = Some(p),
            ProgressReport::Pid(pid) => instance.pid = Some(pid),
            ProgressReport::Ports(ports) => instance.ports = ports,
            ProgressReport::State { state, message } => instance.transition(state, message)?,
        },
        Target::Subordinate(index) => match report {
            ProgressReport::State { state, message } => {
                instance.transition_subordinate(index, state, message)?
            }
            other => {
                let sub = instance.subordinate_mut(index)?;
                match other {
                    ProgressReport::DownloadProgress(p) => sub.download_progress = Some(p),
                    ProgressReport::Pid(pid) => sub.pid = Some(pid),
                    ProgressReport::Ports(ports) => sub.ports = ports,
                    ProgressReport::State { .. } => {}
                }
            }
        },
    }
    Ok(())
}

/// Why a lifecycle cycle ended
#[derive(Debug)]
enum Stop {
    /// The task was cancelled
    Cancelled,
    /// The instance or its spec no longer exists
    Gone,
    /// Irrecoverable failure; the instance must move to `error`
    Failed(String),
    /// The instance is already in a terminal state
    Halted,
}

impl From<FleetError> for Stop {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::NotFound { .. } => Stop::Gone,
            other => Stop::Failed(other.to_string()),
        }
    }
}

fn timed_out(phase: &str, limit: Duration) -> Stop {
    Stop::Failed(
        FleetError::Timeout(format!(
            "{} did not finish within {}s",
            phase,
            limit.as_secs()
        ))
        .to_string(),
    )
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Driver {
    instance_id: Uuid,
    store: Arc<Store>,
    runtime: Arc<dyn Runtime>,
    config: LifecycleConfig,
    lock: Arc<Mutex<()>>,
    cancel: watch::Receiver<bool>,
    restart: Arc<Notify>,
    /// Processes started in the current cycle
    launched: Vec<u32>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let stop = match self.cycle().await {
                Ok(never) => match never {},
                Err(stop) => stop,
            };
            self.teardown().await;

            match stop {
                Stop::Cancelled => {
                    debug!(instance_id = %self.instance_id, "Lifecycle cancelled");
                    return;
                }
                Stop::Gone => {
                    debug!(instance_id = %self.instance_id, "Instance gone, ending lifecycle");
                    return;
                }
                Stop::Failed(message) => {
                    error!(instance_id = %self.instance_id, error = %message, "Instance failed");
                    match self
                        .write(move |i| {
                            i.fail(message);
                            Ok(())
                        })
                        .await
                    {
                        Ok(_) => {}
                        Err(Stop::Gone) => return,
                        Err(other) => {
                            warn!(
                                instance_id = %self.instance_id,
                                reason = ?other,
                                "Could not record failure"
                            )
                        }
                    }
                }
                Stop::Halted => {}
            }

            if !self.wait_for_restart().await {
                return;
            }
        }
    }

    /// One pass from `initializing`/`pending` to serving. Only ever returns
    /// through a [`Stop`].
    async fn cycle(&mut self) -> Result<Infallible, Stop> {
        let mut instance = self.load().await?;
        if instance.state == InstanceState::Initializing {
            instance = self.transition(InstanceState::Pending, None).await?;
        }
        match instance.state {
            InstanceState::Pending => {}
            InstanceState::Error | InstanceState::Unreachable => return Err(Stop::Halted),
            other => {
                return Err(Stop::Failed(format!(
                    "lifecycle cannot resume an instance in {}",
                    other
                )))
            }
        }
        let spec = self.store.get_spec(instance.model_id).await?;

        let path = self.fetch_files(&instance).await?;
        self.analyze(&spec, &path).await?;
        self.start(&spec, &path).await?;
        self.monitor().await
    }

    async fn fetch_files(&self, instance: &ModelInstance) -> Result<PathBuf, Stop> {
        let runtime = Arc::clone(&self.runtime);
        let source = instance.source.clone();
        let limit = self.config.download_timeout();
        let mirror = mirrors_download(instance);

        if let Some(path) = self
            .bounded("locating model files", limit, runtime.locate(&source))
            .await?
        {
            debug!(instance_id = %self.instance_id, path = %path.display(), "Model files present");
            return Ok(path);
        }

        let subordinates = instance.subordinates().len();
        self.write(move |i| {
            i.transition(InstanceState::Downloading, None)?;
            i.download_progress = Some(0.0);
            if mirror {
                for index in 0..subordinates {
                    i.transition_subordinate(index, InstanceState::Downloading, None)?;
                    i.subordinate_mut(index)?.download_progress = Some(0.0);
                }
            }
            Ok(())
        })
        .await?;
        info!(
            instance_id = %self.instance_id,
            source = %source.readable_source(),
            "Instance downloading"
        );

        let (tx, mut rx) = mpsc::channel::<f64>(16);
        let download = runtime.download(&source, tx);
        tokio::pin!(download);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let mut cancel = self.cancel.clone();

        loop {
            tokio::select! {
                result = &mut download => return result.map_err(Stop::from),
                Some(progress) = rx.recv() => {
                    self.write(move |i| {
                        i.download_progress = Some(progress);
                        if mirror {
                            if let Some(ds) = i.distributed_servers.as_mut() {
                                for sub in &mut ds.subordinate_workers {
                                    sub.download_progress = Some(progress);
                                }
                            }
                        }
                        Ok(())
                    })
                    .await?;
                }
                _ = &mut deadline => return Err(timed_out("downloading", limit)),
                _ = cancelled(&mut cancel) => return Err(Stop::Cancelled),
            }
        }
    }

    async fn analyze(&self, spec: &ModelSpec, path: &Path) -> Result<(), Stop> {
        self.write(|i| {
            i.transition(InstanceState::Analyzing, None)?;
            if i.download_progress.is_some() {
                i.download_progress = Some(1.0);
            }
            for index in 0..i.subordinates().len() {
                i.transition_subordinate(index, InstanceState::Analyzing, None)?;
            }
            Ok(())
        })
        .await?;
        info!(
            instance_id = %self.instance_id,
            state = %InstanceState::Analyzing,
            "Instance state changed"
        );

        let runtime = Arc::clone(&self.runtime);
        let limit = self.config.analyze_timeout();
        let analysis = self.bounded("analyzing", limit, runtime.analyze(path)).await?;

        let rescale = spec.resolved_backend() == Backend::LlamaBox;
        let resolved = path.display().to_string();
        self.write(move |i| {
            i.resolved_path = Some(resolved);
            if let (true, Some(layers)) = (rescale, analysis.total_layers) {
                if let Some(claim) = i.computed_resource_claim.as_mut() {
                    claim.rescale_layers(layers);
                }
            }
            Ok(())
        })
        .await?;
        debug!(
            instance_id = %self.instance_id,
            architecture = analysis.architecture.as_deref().unwrap_or("unknown"),
            total_layers = ?analysis.total_layers,
            "Model analyzed"
        );
        Ok(())
    }

    /// Launch main and subordinate processes in coordination-mode order.
    async fn start(&mut self, spec: &ModelSpec, path: &Path) -> Result<(), Stop> {
        let instance = self.load().await?;
        let deadline = Instant::now() + self.config.start_timeout();
        let subordinates = instance.subordinates().len();

        let Some(ds) = instance.distributed_servers.as_ref() else {
            self.start_main(spec, path, Vec::new(), deadline).await?;
            return Ok(());
        };
        let download = ds.download_model_files;
        info!(
            instance_id = %self.instance_id,
            mode = %ds.mode,
            subordinates = subordinates,
            "Starting distributed instance"
        );

        match ds.mode {
            CoordinateMode::Delegated => {
                let mut peers = Vec::with_capacity(subordinates);
                for index in 0..subordinates {
                    peers.extend(
                        self.start_subordinate(spec, path, download, index, false, deadline)
                            .await?,
                    );
                }
                if self.start_main(spec, path, peers, deadline).await? {
                    self.confirm_subordinates().await?;
                }
            }
            CoordinateMode::InitializeLater => {
                if self.start_main(spec, path, Vec::new(), deadline).await? {
                    for index in 0..subordinates {
                        self.start_subordinate(spec, path, download, index, true, deadline)
                            .await?;
                    }
                }
            }
            CoordinateMode::RunFirst => {
                let mut peers = Vec::with_capacity(subordinates);
                for index in 0..subordinates {
                    peers.extend(
                        self.start_subordinate(spec, path, download, index, true, deadline)
                            .await?,
                    );
                }
                self.start_main(spec, path, peers, deadline).await?;
            }
        }
        Ok(())
    }

    /// Launch the main process and wait until it serves. Returns `false` when
    /// the runtime only reserved resources and the instance is `scheduled`.
    async fn start_main(
        &mut self,
        spec: &ModelSpec,
        path: &Path,
        peers: Vec<String>,
        deadline: Instant,
    ) -> Result<bool, Stop> {
        let instance = self.transition(InstanceState::Starting, None).await?;
        let request = LaunchRequest {
            instance,
            spec: spec.clone(),
            target: Target::Main,
            model_path: Some(path.to_path_buf()),
            peers,
        };

        let (pid, ports) = match self.launch(&request, deadline).await? {
            LaunchOutcome::Launched { pid, ports } => (pid, ports),
            LaunchOutcome::Reserved => {
                self.transition(InstanceState::Scheduled, None).await?;
                return Ok(false);
            }
        };
        let recorded = ports.clone();
        let instance = self
            .write(move |i| {
                i.pid = Some(pid);
                i.ports = recorded;
                Ok(())
            })
            .await?;

        let endpoint = instance
            .worker_ip
            .clone()
            .zip(ports.first().copied());
        self.wait_ready(pid, endpoint, deadline, "main worker").await?;
        self.transition(InstanceState::Running, None).await?;
        Ok(true)
    }

    /// Launch subordinate `index`, returning its `ip:port` for the main worker.
    /// With `wait` the subordinate must be up before this returns.
    async fn start_subordinate(
        &mut self,
        spec: &ModelSpec,
        path: &Path,
        download: bool,
        index: usize,
        wait: bool,
        deadline: Instant,
    ) -> Result<Option<String>, Stop> {
        let instance = self
            .write(move |i| i.transition_subordinate(index, InstanceState::Starting, None))
            .await?;
        let worker_ip = instance
            .subordinates()
            .get(index)
            .map(|s| s.worker_ip.clone())
            .unwrap_or_default();
        let request = LaunchRequest {
            instance,
            spec: spec.clone(),
            target: Target::Subordinate(index),
            model_path: download.then(|| path.to_path_buf()),
            peers: Vec::new(),
        };

        let peer = match self.launch(&request, deadline).await? {
            LaunchOutcome::Launched { pid, ports } => {
                let peer = ports.first().map(|port| format!("{}:{}", worker_ip, port));
                self.write(move |i| {
                    let sub = i.subordinate_mut(index)?;
                    sub.pid = Some(pid);
                    sub.ports = ports;
                    Ok(())
                })
                .await?;
                if wait {
                    self.wait_ready(pid, None, deadline, "subordinate worker").await?;
                    self.mark_subordinate_running(index).await?;
                }
                peer
            }
            LaunchOutcome::Reserved => {
                self.mark_subordinate_running(index).await?;
                None
            }
        };
        Ok(peer)
    }

    /// Delegated subordinates are left in `starting` until the main worker serves.
    async fn confirm_subordinates(&self) -> Result<(), Stop> {
        let instance = self.load().await?;
        for (index, sub) in instance.subordinates().iter().enumerate() {
            if sub.state != InstanceState::Starting {
                continue;
            }
            if let Some(pid) = sub.pid {
                if !self.runtime.is_alive(pid).await {
                    return Err(Stop::Failed(format!(
                        "subordinate worker {} exited during startup",
                        sub.worker_name
                    )));
                }
            }
            self.mark_subordinate_running(index).await?;
        }
        Ok(())
    }

    async fn mark_subordinate_running(&self, index: usize) -> Result<(), Stop> {
        let instance = self
            .write(move |i| i.transition_subordinate(index, InstanceState::Running, None))
            .await?;
        if let Some(sub) = instance.subordinates().get(index) {
            info!(
                instance_id = %self.instance_id,
                worker = %sub.worker_name,
                state = %sub.state,
                "Subordinate worker state changed"
            );
        }
        Ok(())
    }

    async fn launch(
        &mut self,
        request: &LaunchRequest,
        deadline: Instant,
    ) -> Result<LaunchOutcome, Stop> {
        let runtime = Arc::clone(&self.runtime);
        let outcome = self
            .bounded_until("starting", deadline, runtime.launch(request))
            .await?;
        if let LaunchOutcome::Launched { pid, .. } = &outcome {
            self.launched.push(*pid);
        }
        Ok(outcome)
    }

    /// Poll until the process serves (or, without an endpoint, is simply alive).
    async fn wait_ready(
        &self,
        pid: u32,
        endpoint: Option<(String, u16)>,
        deadline: Instant,
        what: &str,
    ) -> Result<(), Stop> {
        let runtime = Arc::clone(&self.runtime);
        let probe = async {
            loop {
                if !runtime.is_alive(pid).await {
                    return Err(FleetError::Runtime(format!(
                        "{} process {} exited during startup",
                        what, pid
                    )));
                }
                match &endpoint {
                    Some((ip, port)) => {
                        if runtime.is_healthy(ip, *port).await {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
                tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
            }
        };
        self.bounded_until("starting", deadline, probe).await
    }

    /// Probe the serving instance until it fails or stops answering.
    async fn monitor(&self) -> Result<Infallible, Stop> {
        let threshold = self.config.unreachable_threshold.max(1);
        let mut failures = 0u32;

        loop {
            self.sleep(self.config.health_check_interval()).await?;
            let instance = self.load().await?;
            if instance.state.is_terminal() {
                return Err(Stop::Halted);
            }

            if let Some(pid) = instance.pid {
                if !self.runtime.is_alive(pid).await {
                    return Err(Stop::Failed(format!("backend process {} exited", pid)));
                }
            }
            for sub in instance.subordinates() {
                if let Some(pid) = sub.pid {
                    if !self.runtime.is_alive(pid).await {
                        return Err(Stop::Failed(format!(
                            "subordinate worker {} exited",
                            sub.worker_name
                        )));
                    }
                }
            }

            let healthy = match (&instance.worker_ip, instance.ports.first()) {
                (Some(ip), Some(port)) => self.runtime.is_healthy(ip, *port).await,
                _ => true,
            };
            if healthy {
                if failures > 0 {
                    debug!(instance_id = %self.instance_id, "Health checks recovered");
                }
                failures = 0;
                continue;
            }

            failures += 1;
            warn!(
                instance_id = %self.instance_id,
                failures = failures,
                threshold = threshold,
                "Health check failed"
            );
            if failures >= threshold {
                let message = format!("{} consecutive health checks failed", failures);
                self.transition(InstanceState::Unreachable, Some(message))
                    .await?;
                return Err(Stop::Halted);
            }
        }
    }

    /// Decide what follows a terminal state. `true` starts a new cycle.
    async fn wait_for_restart(&mut self) -> bool {
        loop {
            let Ok(instance) = self.store.get_instance(self.instance_id).await else {
                return false;
            };
            if !instance.state.is_terminal() {
                return true;
            }
            let Ok(spec) = self.store.get_spec(instance.model_id).await else {
                return false;
            };

            let automatic =
                instance.state == InstanceState::Unreachable || spec.restart_on_error;
            if !automatic {
                debug!(
                    instance_id = %self.instance_id,
                    "restart_on_error is disabled, waiting for an operator restart"
                );
                let mut cancel = self.cancel.clone();
                tokio::select! {
                    _ = self.restart.notified() => continue,
                    _ = cancelled(&mut cancel) => return false,
                }
            }

            if self.sleep(self.config.restart_backoff()).await.is_err() {
                return false;
            }
            let restart_on_error = spec.restart_on_error;
            match self
                .write(move |i| i.restart(restart_on_error).map(|_| ()))
                .await
            {
                Ok(instance) if !instance.state.is_terminal() => {
                    info!(
                        instance_id = %self.instance_id,
                        restart_count = instance.restart_count,
                        "Restarting instance"
                    );
                    return true;
                }
                Ok(_) => continue,
                Err(Stop::Gone) | Err(Stop::Cancelled) => return false,
                Err(_) => continue,
            }
        }
    }

    /// Best-effort stop of every process launched in this cycle
    async fn teardown(&mut self) {
        for pid in self.launched.drain(..) {
            if let Err(e) = self.runtime.stop(pid).await {
                warn!(
                    instance_id = %self.instance_id,
                    pid = pid,
                    error = %e,
                    "Failed to stop process"
                );
            }
        }
    }

    async fn load(&self) -> Result<ModelInstance, Stop> {
        Ok(self.store.get_instance(self.instance_id).await?)
    }

    async fn write<F>(&self, f: F) -> Result<ModelInstance, Stop>
    where
        F: FnOnce(&mut ModelInstance) -> FleetResult<()> + Send,
    {
        let _guard = self.lock.lock().await;
        Ok(self.store.update_instance(self.instance_id, f).await?)
    }

    async fn transition(
        &self,
        to: InstanceState,
        message: Option<String>,
    ) -> Result<ModelInstance, Stop> {
        let instance = self.write(move |i| i.transition(to, message)).await?;
        info!(
            instance_id = %self.instance_id,
            name = %instance.name,
            state = %to,
            "Instance state changed"
        );
        Ok(instance)
    }

    async fn sleep(&self, duration: Duration) -> Result<(), Stop> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancelled(&mut cancel) => Err(Stop::Cancelled),
        }
    }

    async fn bounded<T>(
        &self,
        phase: &str,
        limit: Duration,
        fut: impl Future<Output = FleetResult<T>>,
    ) -> Result<T, Stop> {
        self.bounded_until(phase, Instant::now() + limit, fut).await
    }

    async fn bounded_until<T>(
        &self,
        phase: &str,
        deadline: Instant,
        fut: impl Future<Output = FleetResult<T>>,
    ) -> Result<T, Stop> {
        let mut cancel = self.cancel.clone();
        let limit = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            result = tokio::time::timeout_at(deadline, fut) => match result {
                Ok(result) => result.map_err(Stop::from),
                Err(_) => Err(timed_out(phase, limit)),
            },
            _ = cancelled(&mut cancel) => Err(Stop::Cancelled),
        }
    }
}

/// Subordinates follow the main worker through `downloading` only when they
/// need the model files themselves.
fn mirrors_download(instance: &ModelInstance) -> bool {
    instance
        .distributed_servers
        .as_ref()
        .is_some_and(|ds| ds.download_model_files)
}
