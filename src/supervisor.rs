//! Live service handles kept in lock-step with the declarative service list
//!
//! Every executable of a running service is owned by its own supervision
//! task. The task waits on the child, relaunches it when configured to, and
//! performs the SIGTERM / grace period / SIGKILL sequence when asked to stop.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigStore, Configuration, ExecutableSettings, Service};
use crate::error::{Error, Result};

/// Conditions a live handle reports back to its caller
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

struct Running {
    alive: Arc<AtomicBool>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One supervised process slot
struct Executable {
    settings: ExecutableSettings,
    running: Option<Running>,
}

impl Executable {
    fn new(settings: ExecutableSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.alive.load(Ordering::SeqCst))
    }

    fn launch(&mut self, service: &str) -> std::result::Result<(), ServiceError> {
        let child = spawn_child(service, &self.settings)?;
        let alive = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            service.to_string(),
            self.settings.clone(),
            child,
            stop_rx,
            Arc::clone(&alive),
        ));
        self.running = Some(Running {
            alive,
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Returns whether the executable was running
    async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        let was_alive = running.alive.load(Ordering::SeqCst);
        let _ = running.stop_tx.send(());
        let _ = running.task.await;
        was_alive
    }
}

fn spawn_child(service: &str, settings: &ExecutableSettings) -> std::result::Result<Child, ServiceError> {
    let mut cmd = Command::new(&settings.command);
    cmd.args(&settings.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(ref dirname) = settings.dirname {
        cmd.current_dir(dirname);
    }
    cmd.envs(&settings.env);

    let mut child = cmd.spawn().map_err(|source| ServiceError::Spawn {
        command: settings.command.clone(),
        source,
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(service.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(service.to_string(), "stderr", stderr));
    }

    let pid = child.id().unwrap_or(0);
    info!(service, command = %settings.command, pid, "Executable spawned");
    Ok(child)
}

async fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(service = %service, stream, "{}", line);
    }
}

async fn supervise(
    service: String,
    settings: ExecutableSettings,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
) {
    let grace_period = Duration::from_secs(settings.shutdown_grace_period_secs);
    let relaunch_delay = Duration::from_secs(settings.relaunch_delay_secs);

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(service = %service, command = %settings.command, ?status, "Executable exited"),
                    Err(e) => warn!(service = %service, error = %e, "Error waiting for executable"),
                }
                if !settings.relaunch {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(relaunch_delay) => {}
                    _ = &mut stop_rx => break,
                }

                match spawn_child(&service, &settings) {
                    Ok(next) => {
                        info!(service = %service, command = %settings.command, "Executable relaunched");
                        child = next;
                    }
                    Err(e) => {
                        error!(service = %service, error = %e, "Failed to relaunch executable");
                        break;
                    }
                }
            }
            _ = &mut stop_rx => {
                stop_child(&service, &mut child, grace_period).await;
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}

async fn stop_child(service: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(service, pid, "Sending SIGTERM to executable");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(service, ?status, "Executable exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(service, error = %e, "Error waiting for executable to exit");
        }
        Err(_) => {
            warn!(
                service,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Live counterpart of one declarative [`Service`]
pub struct ServiceHandle {
    name: String,
    executables: Vec<Executable>,
}

impl ServiceHandle {
    pub fn new(service: &Service) -> Self {
        Self {
            name: service.name.clone(),
            executables: service
                .executables
                .iter()
                .cloned()
                .map(Executable::new)
                .collect(),
        }
    }

    /// Launch every executable that is not running
    pub async fn start(&mut self) -> std::result::Result<(), ServiceError> {
        if self.executables.is_empty() {
            return Ok(());
        }
        let launched = self.launch_where(|_| true).await?;
        if launched == 0 {
            return Err(ServiceError::AlreadyRunning);
        }
        info!(service = %self.name, launched, "Service started");
        Ok(())
    }

    /// Launch the executables flagged for autolaunch
    pub async fn start_autolaunch(&mut self) -> std::result::Result<(), ServiceError> {
        let launched = self.launch_where(|settings| settings.autolaunch).await?;
        if launched > 0 {
            info!(service = %self.name, launched, "Service autolaunched");
        }
        Ok(())
    }

    /// A spawn failure stops whatever this call already launched.
    async fn launch_where<F>(&mut self, select: F) -> std::result::Result<usize, ServiceError>
    where
        F: Fn(&ExecutableSettings) -> bool,
    {
        let mut launched: Vec<usize> = Vec::new();
        for i in 0..self.executables.len() {
            let exec = &mut self.executables[i];
            if !select(&exec.settings) || exec.is_running() {
                continue;
            }
            if let Err(e) = exec.launch(&self.name) {
                for j in launched {
                    self.executables[j].stop().await;
                }
                return Err(e);
            }
            launched.push(i);
        }
        Ok(launched.len())
    }

    /// Stop every running executable
    pub async fn stop(&mut self) -> std::result::Result<(), ServiceError> {
        let mut stopped = 0;
        for exec in &mut self.executables {
            if exec.stop().await {
                stopped += 1;
            }
        }
        if stopped == 0 {
            return Err(ServiceError::NotRunning);
        }
        info!(service = %self.name, stopped, "Service stopped");
        Ok(())
    }

    /// Running flag per executable, in settings order
    pub fn running(&self) -> Vec<bool> {
        self.executables.iter().map(Executable::is_running).collect()
    }

    pub fn is_running(&self) -> bool {
        self.executables.iter().any(Executable::is_running)
    }
}

/// A service's declarative settings plus the live running state
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub service: Service,
    pub running: Vec<bool>,
}

/// Map from service name to live handle.
///
/// Every operation that changes the declarative list goes through the
/// [`ConfigStore`] first; live state is only touched once the new
/// configuration is on disk, so a failed write leaves both sides unchanged.
#[derive(Default)]
pub struct ServiceSupervisor {
    services: HashMap<String, ServiceHandle>,
}

impl ServiceSupervisor {
    pub fn from_config(config: &Configuration) -> Self {
        let services = config
            .services
            .iter()
            .map(|service| (service.name.clone(), ServiceHandle::new(service)))
            .collect();
        Self { services }
    }

    /// Start every autolaunch executable; failures are logged
    pub async fn launch_autolaunch(&mut self) {
        for handle in self.services.values_mut() {
            if let Err(e) = handle.start_autolaunch().await {
                error!(service = %handle.name, error = %e, "Autolaunch failed");
            }
        }
    }

    pub async fn add_service(
        &mut self,
        store: &mut ConfigStore,
        name: &str,
        mut service: Service,
    ) -> Result<()> {
        if self.services.contains_key(name) || store.config().service(name).is_some() {
            return Err(Error::Conflict(format!("Service {} already exists.", name)));
        }
        service.name = name.to_string();

        store.update(|config| {
            config.services.push(service.clone());
            config.validate()
        })?;

        let mut handle = ServiceHandle::new(&service);
        if let Err(e) = handle.start_autolaunch().await {
            error!(service = name, error = %e, "Autolaunch failed");
        }
        self.services.insert(name.to_string(), handle);
        info!(service = name, "Service added");
        Ok(())
    }

    pub async fn delete_service(&mut self, store: &mut ConfigStore, name: &str) -> Result<()> {
        if !self.services.contains_key(name) {
            return Err(not_found(name));
        }

        store.update(|config| {
            config.services.retain(|s| s.name != name);
            Ok(())
        })?;

        if let Some(mut handle) = self.services.remove(name) {
            match handle.stop().await {
                Ok(()) | Err(ServiceError::NotRunning) => {}
                Err(e) => warn!(service = name, error = %e, "Error stopping deleted service"),
            }
        }
        info!(service = name, "Service deleted");
        Ok(())
    }

    /// Replace a service's settings. The new handle is not started.
    pub async fn update_service(
        &mut self,
        store: &mut ConfigStore,
        name: &str,
        mut service: Service,
    ) -> Result<()> {
        if !self.services.contains_key(name) {
            return Err(not_found(name));
        }
        service.name = name.to_string();

        store.update(|config| {
            let slot = config.service_mut(name).ok_or_else(|| not_found(name))?;
            *slot = service.clone();
            config.validate()
        })?;

        let next = ServiceHandle::new(&service);
        if let Some(mut previous) = self.services.insert(name.to_string(), next) {
            let _ = previous.stop().await;
        }
        info!(service = name, "Service updated");
        Ok(())
    }

    pub async fn start_service(&mut self, name: &str) -> Result<()> {
        let handle = self.services.get_mut(name).ok_or_else(|| not_found(name))?;
        handle.start().await?;
        Ok(())
    }

    pub async fn stop_service(&mut self, name: &str) -> Result<()> {
        let handle = self.services.get_mut(name).ok_or_else(|| not_found(name))?;
        handle.stop().await?;
        Ok(())
    }

    /// Status of every declared service, in configuration order
    pub fn statuses(&self, config: &Configuration) -> Vec<ServiceStatus> {
        config
            .services
            .iter()
            .map(|service| ServiceStatus {
                service: service.clone(),
                running: self
                    .services
                    .get(&service.name)
                    .map(ServiceHandle::running)
                    .unwrap_or_else(|| vec![false; service.executables.len()]),
            })
            .collect()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.services.keys().cloned().collect()
    }

    pub async fn stop_all(&mut self) {
        for handle in self.services.values_mut() {
            match handle.stop().await {
                Ok(()) | Err(ServiceError::NotRunning) => {}
                Err(e) => warn!(service = %handle.name, error = %e, "Error stopping service"),
            }
        }
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound(format!("Service {} not found.", name))
}
