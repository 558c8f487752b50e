use crate::parse::ProcessSpec;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};


/// Why an instance went down without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Crash {
    /// Terminated by a signal.
    Signal(i32),
    /// The executable could not be started at all.
    LaunchFailure(String),
    /// Waiting on the child failed; its fate is unknown.
    Lost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(i32),
    Crashed(Crash),
    Stopped,
}

impl ProcessState {
    pub fn is_terminal_exit(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Crashed(_))
    }

    /// Whether `next` is a legal successor of `self`. `Stopped` is final.
    pub fn can_transition_to(&self, next: &ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Starting, Running) => true,
            (Starting, Crashed(Crash::LaunchFailure(_))) => true,
            (Running, Exited(_)) | (Running, Crashed(_)) => true,
            (Exited(_), Starting) | (Crashed(_), Starting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(code) => write!(f, "exited({code})"),
            ProcessState::Crashed(Crash::Signal(sig)) => match Signal::try_from(*sig) {
                Ok(sig) => write!(f, "crashed({sig})"),
                Err(_) => write!(f, "crashed(signal {sig})"),
            },
            ProcessState::Crashed(Crash::LaunchFailure(msg)) => write!(f, "crashed(launch failure: {msg})"),
            ProcessState::Crashed(Crash::Lost(msg)) => write!(f, "crashed(lost: {msg})"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Code(code),
            (None, Some(sig)) => ExitOutcome::Signal(sig),
            // unreachable on unix; treat as a generic failure
            (None, None) => ExitOutcome::Code(-1),
        }
    }
}

impl From<ExitOutcome> for ProcessState {
    fn from(outcome: ExitOutcome) -> Self {
        match outcome {
            ExitOutcome::Code(code) => ProcessState::Exited(code),
            ExitOutcome::Signal(sig) => ProcessState::Crashed(Crash::Signal(sig)),
        }
    }
}

/// Point-in-time copy of a handle, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub name: String,
    pub instance: usize,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub restart_count: u64,
    pub since: DateTime<Local>,
}

/// Published on every state transition of every handle.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub name: String,
    pub instance: usize,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restart_count: u64,
    pub at: DateTime<Local>,
}

pub type EventSender = broadcast::Sender<SupervisorEvent>;

#[derive(Debug)]
struct HandleInner {
    pid: Option<u32>,
    state: ProcessState,
    restart_count: u64,
    since: DateTime<Local>,
}

/// Runtime record of one instance slot of a program.
///
/// Only the observer task of the slot writes to it; everybody else reads
/// snapshots. The spec is referenced weakly, the supervisor owns it.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: Weak<ProcessSpec>,
    name: String,
    instance: usize,
    inner: RwLock<HandleInner>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn new(spec: &Arc<ProcessSpec>, instance: usize) -> Self {
        ProcessHandle {
            spec: Arc::downgrade(spec),
            name: spec.name.clone(),
            instance,
            inner: RwLock::new(HandleInner {
                pid: None,
                state: ProcessState::Starting,
                restart_count: 0,
                since: Local::now(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn spec(&self) -> Option<Arc<ProcessSpec>> {
        self.spec.upgrade()
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.read().await.state.clone()
    }

    pub async fn snapshot(&self) -> ProcessSnapshot {
        let inner = self.inner.read().await;
        ProcessSnapshot {
            name: self.name.clone(),
            instance: self.instance,
            pid: inner.pid,
            state: inner.state.clone(),
            restart_count: inner.restart_count,
            since: inner.since,
        }
    }

    /// Ask the observer to stop the instance. Pending restarts are dropped.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Applies a transition if it is legal. Returns false when it was
    /// refused, in particular once the handle is `Stopped`.
    async fn transition(&self, next: ProcessState, pid: Option<u32>, restarted: bool, events: &EventSender) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.state.can_transition_to(&next) {
            if inner.state != ProcessState::Stopped {
                warn!(program = %self.name, instance = self.instance, from = %inner.state, to = %next, "Refused illegal state transition");
            }
            return false;
        }
        inner.state = next;
        inner.pid = pid;
        inner.since = Local::now();
        if restarted {
            inner.restart_count += 1;
        }
        let _ = events.send(SupervisorEvent {
            name: self.name.clone(),
            instance: self.instance,
            state: inner.state.clone(),
            pid: inner.pid,
            restart_count: inner.restart_count,
            at: inner.since,
        });
        true
    }

    /// Forces the terminal `Stopped` state. Idempotent.
    pub async fn mark_stopped(&self, events: &EventSender) {
        self.transition(ProcessState::Stopped, None, false, events).await;
    }
}



/// A launched child, as far as the supervisor cares.
#[async_trait]
pub trait SupervisedChild: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for the child to end. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<ExitOutcome>;

    /// Delivers `signal` to the child and everything it spawned.
    fn signal(&mut self, signal: Signal) -> io::Result<()>;
}

/// Launches children for a spec. Swapped out for a fake in tests.
#[async_trait]
pub trait ProcessSpawner: Send + Sync + 'static {
    async fn spawn(&self, spec: &ProcessSpec, instance: usize) -> io::Result<Box<dyn SupervisedChild>>;
}

/// Environment variable carrying the instance slot to the child.
pub const INSTANCE_ENV: &str = "FORKVISOR_INSTANCE";

/// Spawns real OS processes, each detached into its own session.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;



/*
    @@@
    @OsSpawner::spawn();
    . Builds the command line from the spec, with stdin on /dev/null and stdout/stderr appended to the configured files (or /dev/null).
    . Applies cwd and env, and exports the instance slot to the child.
    . Detaches the child into a new session (setsid()) so stop signals reach the whole process tree.
*/
#[async_trait]
impl ProcessSpawner for OsSpawner {
    async fn spawn(&self, spec: &ProcessSpec, instance: usize) -> io::Result<Box<dyn SupervisedChild>> {
        let mut cmd = tokio::process::Command::new(&spec.executable);
        cmd.args(&spec.arguments)
            .stdin(Stdio::null())
            .stdout(output_target(spec.out_file.as_deref())?)
            .stderr(output_target(spec.error_file.as_deref())?)
            .envs(&spec.env)
            .env(INSTANCE_ENV, instance.to_string())
            .kill_on_drop(false);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }

        let child = cmd.spawn()?;
        Ok(Box::new(OsChild { child }))
    }
}

fn output_target(path: Option<&Path>) -> io::Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file: File = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Stdio::from(file))
}

struct OsChild {
    child: tokio::process::Child,
}

#[async_trait]
impl SupervisedChild for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        self.child.wait().await.map(ExitOutcome::from)
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        // already reaped: nothing left to signal
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        killpg(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }
}



/// Everything an observer task needs to run one slot.
pub struct InstanceContext {
    pub handle: Arc<ProcessHandle>,
    pub spec: Arc<ProcessSpec>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub events: EventSender,
}



/*
    @@@
    @supervise_instance();
    . Launches the slot's child and marks it Running, or Crashed(LaunchFailure) if the launch fails.
    . Waits for the child to end while listening for a stop request; on stop, sends the stop signal and SIGKILL after kill_timeout.
    . After any exit, sleeps restart_delay and relaunches; a stop during the delay cancels the relaunch.
    . Always leaves the handle Stopped when it returns.
*/
pub async fn supervise_instance(ctx: InstanceContext) {
    let InstanceContext { handle, spec, spawner, events } = ctx;
    let name = spec.name.as_str();
    let instance = handle.instance();
    let mut relaunch = false;

    loop {
        if handle.stop_requested() {
            break;
        }
        if relaunch && !handle.transition(ProcessState::Starting, None, true, &events).await {
            break;
        }
        relaunch = true;

        match spawner.spawn(&spec, instance).await {
            Ok(mut child) => {
                let pid = child.id();
                info!(program = name, instance, pid, command = %spec.command_line(), "Spawned new instance");
                handle.transition(ProcessState::Running, pid, false, &events).await;

                let outcome = tokio::select! {
                    biased;
                    _ = handle.cancel.cancelled() => {
                        terminate(&spec, instance, child.as_mut()).await;
                        break;
                    }
                    outcome = child.wait() => outcome,
                };

                let next = match outcome {
                    Ok(outcome) => {
                        match outcome {
                            ExitOutcome::Code(code) => info!(program = name, instance, pid, exit_code = code, "Child process exited"),
                            ExitOutcome::Signal(sig) => warn!(program = name, instance, pid, signal = sig, "Child process killed by signal"),
                        }
                        ProcessState::from(outcome)
                    }
                    Err(e) => {
                        error!(program = name, instance, pid, error = %e, "Lost track of child process");
                        ProcessState::Crashed(Crash::Lost(e.to_string()))
                    }
                };
                handle.transition(next, None, false, &events).await;
            }
            Err(e) => {
                warn!(program = name, instance, error = %e, "Failed to launch");
                handle
                    .transition(ProcessState::Crashed(Crash::LaunchFailure(e.to_string())), None, false, &events)
                    .await;
            }
        }

        let delay_ms = spec.restart_delay.as_millis() as u64;
        info!(program = name, instance, delay_ms, "Restarting after delay");
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            _ = sleep(spec.restart_delay) => {}
        }
    }

    handle.mark_stopped(&events).await;
    info!(program = name, instance, "Instance stopped");
}



/*
    @@@
    @terminate();
    . Sends the spec's stop signal to the child's process group.
    . Waits up to kill_timeout for it to exit, then force-kills with SIGKILL and reaps it.
*/
async fn terminate(spec: &ProcessSpec, instance: usize, child: &mut dyn SupervisedChild) {
    let name = spec.name.as_str();
    let pid = child.id();
    info!(program = name, instance, pid, signal = ?spec.stop_signal, "Sending stop signal");
    if let Err(e) = child.signal(spec.stop_signal) {
        error!(program = name, instance, pid, error = %e, "Failed to send stop signal");
    }

    let waited = timeout(spec.kill_timeout, child.wait()).await;
    match waited {
        Ok(Ok(outcome)) => info!(program = name, instance, pid, outcome = ?outcome, "Exited cleanly"),
        Ok(Err(e)) => warn!(program = name, instance, pid, error = %e, "Wait failed after stop signal"),
        Err(_) => {
            warn!(program = name, instance, pid, "Sending SIGKILL after kill timeout");
            if let Err(e) = child.signal(Signal::SIGKILL) {
                error!(program = name, instance, pid, error = %e, "Failed to SIGKILL");
            }
            if let Err(e) = child.wait().await {
                warn!(program = name, instance, pid, error = %e, "Wait failed after SIGKILL");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_is_terminal() {
        let stopped = ProcessState::Stopped;
        assert!(!stopped.can_transition_to(&ProcessState::Starting));
        assert!(!stopped.can_transition_to(&ProcessState::Running));
        assert!(!stopped.can_transition_to(&ProcessState::Stopped));
    }

    #[test]
    fn every_live_state_can_stop() {
        for state in [
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Exited(0),
            ProcessState::Crashed(Crash::Signal(9)),
        ] {
            assert!(state.can_transition_to(&ProcessState::Stopped), "{state}");
        }
    }

    #[test]
    fn transitions_cannot_be_skipped() {
        assert!(!ProcessState::Starting.can_transition_to(&ProcessState::Exited(0)));
        assert!(!ProcessState::Running.can_transition_to(&ProcessState::Starting));
        assert!(!ProcessState::Exited(1).can_transition_to(&ProcessState::Running));
        assert!(ProcessState::Starting.can_transition_to(&ProcessState::Crashed(Crash::LaunchFailure("x".into()))));
        assert!(!ProcessState::Starting.can_transition_to(&ProcessState::Crashed(Crash::Signal(9))));
    }

    #[test]
    fn exit_status_maps_to_outcome() {
        use std::process::ExitStatus;
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(3 << 8)), ExitOutcome::Code(3));
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(9)), ExitOutcome::Signal(9));
        assert_eq!(ProcessState::from(ExitOutcome::Signal(9)), ProcessState::Crashed(Crash::Signal(9)));
    }

    #[test]
    fn state_display() {
        assert_eq!(ProcessState::Exited(2).to_string(), "exited(2)");
        assert_eq!(ProcessState::Crashed(Crash::Signal(9)).to_string(), "crashed(SIGKILL)");
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn handle_refuses_transitions_after_stop() {
        let spec = Arc::new(ProcessSpec::new("p", "/bin/true", vec![]));
        let handle = ProcessHandle::new(&spec, 0);
        let (events, mut rx) = broadcast::channel(8);

        assert!(handle.transition(ProcessState::Running, Some(42), false, &events).await);
        handle.mark_stopped(&events).await;
        assert!(!handle.transition(ProcessState::Starting, None, true, &events).await);

        let snap = handle.snapshot().await;
        assert_eq!(snap.state, ProcessState::Stopped);
        assert_eq!(snap.pid, None);
        assert_eq!(snap.restart_count, 0);

        assert_eq!(rx.recv().await.unwrap().state, ProcessState::Running);
        assert_eq!(rx.recv().await.unwrap().state, ProcessState::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_spec_is_weak() {
        let spec = Arc::new(ProcessSpec::new("p", "/bin/true", vec![]));
        let handle = ProcessHandle::new(&spec, 1);
        assert!(handle.spec().is_some());
        drop(spec);
        assert!(handle.spec().is_none());
        assert_eq!(handle.name(), "p");
    }
}
