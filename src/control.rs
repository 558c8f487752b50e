use crate::cli::{Command, USAGE};
use crate::error::SupervisorError;
use crate::parse::ProcessSpec;
use crate::runtime::{
    supervise_instance, EventSender, InstanceContext, ProcessHandle, ProcessSnapshot, ProcessSpawner,
    SupervisorEvent,
};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

const EVENT_CAPACITY: usize = 1024;

/// Resolves once every observer task of a job has returned. Shared, so
/// any number of `stop` callers can wait on the same tasks.
type Finished = Shared<BoxFuture<'static, ()>>;

/// One configured program and the handles of its instance slots.
pub struct RuntimeJob {
    pub spec: Arc<ProcessSpec>,
    pub handles: Vec<Arc<ProcessHandle>>,
    finished: Finished,
}

impl RuntimeJob {
    fn is_live(&self) -> bool {
        self.handles.iter().any(|handle| !handle.stop_requested())
    }
}

/// Launches programs, restarts them when they go down and stops them on
/// request. The handle registry is only ever mutated through here.
pub struct Supervisor {
    spawner: Arc<dyn ProcessSpawner>,
    jobs: RwLock<HashMap<String, RuntimeJob>>,
    events: EventSender,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Supervisor {
            spawner,
            jobs: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Stream of every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }



    /*
        @@@
        @start();
        . Refuses the whole batch if a name repeats within it (DuplicateName) or is still live (AlreadyRunning); a fully stopped name is replaced.
        . Creates instance_count handles per spec, all in Starting, and spawns one observer task per handle.
        . Returns the number of handles without waiting on any process.
    */
    pub async fn start(&self, specs: Vec<ProcessSpec>) -> Result<usize, SupervisorError> {
        let mut jobs = self.jobs.write().await;

        let mut batch = HashSet::new();
        for spec in &specs {
            if !batch.insert(spec.name.as_str()) {
                return Err(SupervisorError::DuplicateName(spec.name.clone()));
            }
            if let Some(job) = jobs.get(&spec.name) {
                if job.is_live() {
                    return Err(SupervisorError::AlreadyRunning(spec.name.clone()));
                }
            }
        }

        let mut launched = 0;
        for spec in specs {
            let spec = Arc::new(spec);
            let mut handles = Vec::with_capacity(spec.instance_count);
            let mut tasks = Vec::with_capacity(spec.instance_count);

            for instance in 0..spec.instance_count {
                let handle = Arc::new(ProcessHandle::new(&spec, instance));
                tasks.push(tokio::spawn(supervise_instance(InstanceContext {
                    handle: handle.clone(),
                    spec: spec.clone(),
                    spawner: self.spawner.clone(),
                    events: self.events.clone(),
                })));
                handles.push(handle);
            }

            info!(program = %spec.name, instances = spec.instance_count, "Started program");
            launched += handles.len();
            let finished = observers_finished(spec.name.clone(), tasks);
            jobs.insert(spec.name.clone(), RuntimeJob { spec, handles, finished });
        }

        Ok(launched)
    }



    /*
        @@@
        @stop();
        . Flags every handle of the program as stopping, which also cancels any pending restart.
        . Releases the registry lock, then waits on the job's shared completion, so concurrent callers all wait for the same observers.
        . Each observer signals its child, escalates to SIGKILL after kill_timeout, and leaves the handle Stopped.
    */
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let (handles, finished) = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            if job.is_live() {
                info!(program = name, instances = job.handles.len(), "Stopping program");
            }
            for handle in &job.handles {
                handle.request_stop();
            }
            (job.handles.clone(), job.finished.clone())
        };

        finished.await;
        // observers normally leave their handle Stopped; this covers one that panicked
        for handle in &handles {
            handle.mark_stopped(&self.events).await;
        }
        Ok(())
    }

    /// Stops every program concurrently.
    pub async fn stop_all(&self) {
        let names = self.names().await;
        info!(programs = names.len(), "Stopping all programs");
        join_all(names.iter().map(|name| self.stop(name))).await;
    }

    pub async fn status(&self, name: &str) -> Result<Vec<ProcessSnapshot>, SupervisorError> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        Ok(snapshots(job).await)
    }

    /// Snapshots of every handle, ordered by program name then instance.
    pub async fn status_all(&self) -> Vec<ProcessSnapshot> {
        let jobs = self.jobs.read().await;
        let mut names: Vec<&String> = jobs.keys().collect();
        names.sort();
        let mut out = Vec::new();
        for name in names {
            out.extend(snapshots(&jobs[name]).await);
        }
        out
    }

    /// Runs one shell or control-socket command and renders its output.
    /// Commands that only make sense on the command line are no-ops here.
    pub async fn execute(&self, command: Command) -> Result<String, SupervisorError> {
        match command {
            Command::Status { name: Some(name) } => self.status(&name).await.map(|s| format_status(&s)),
            Command::Status { name: None } => Ok(format_status(&self.status_all().await)),
            Command::Stop { name } => self.stop(&name).await.map(|()| format!("Stopped `{name}`")),
            Command::StopAll => {
                self.stop_all().await;
                Ok("Stopped all programs".into())
            }
            Command::Exit => Ok("Stopping all programs...".into()),
            Command::Help => Ok(USAGE.into()),
            Command::Start { .. } | Command::Check { .. } | Command::Remote { .. } => Ok(String::new()),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn observers_finished(name: String, tasks: Vec<JoinHandle<()>>) -> Finished {
    async move {
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(program = %name, error = %e, "Observer task failed");
            }
        }
    }
    .boxed()
    .shared()
}

async fn snapshots(job: &RuntimeJob) -> Vec<ProcessSnapshot> {
    let mut out = Vec::with_capacity(job.handles.len());
    for handle in &job.handles {
        out.push(handle.snapshot().await);
    }
    out
}

/// Renders snapshots as the table printed by `status`.
pub fn format_status(snapshots: &[ProcessSnapshot]) -> String {
    let mut out = format!(
        "{:<32} {:>3}  {:<24} {:>8} {:>8}  {}\n",
        "NAME", "ID", "STATE", "PID", "RESTARTS", "SINCE"
    );
    for snap in snapshots {
        let pid = snap.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "{:<32} {:>3}  {:<24} {:>8} {:>8}  {}\n",
            snap.name,
            snap.instance,
            snap.state.to_string(),
            pid,
            snap.restart_count,
            snap.since.format("%Y-%m-%d %H:%M:%S"),
        ));
    }
    out
}
