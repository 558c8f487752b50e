//! In-memory stand-ins for OS processes, used by the test suites.

use crate::parse::ProcessSpec;
use crate::runtime::{ExitOutcome, ProcessSpawner, SupervisedChild};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};

/// What a fake child does once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehaviour {
    /// Runs until signalled or killed through `FakeSpawner::kill`.
    RunForever,
    /// Ends on its own after the delay.
    ExitAfter(Duration, ExitOutcome),
    /// Runs forever and only dies on SIGKILL.
    IgnoreStopSignal,
    /// The launch itself fails.
    FailLaunch,
}

#[derive(Default)]
struct Registry {
    kills: HashMap<(String, usize), mpsc::UnboundedSender<ExitOutcome>>,
    launches: HashMap<String, usize>,
}

/// Spawner producing fake children whose behaviour is chosen per program.
pub struct FakeSpawner {
    behaviours: HashMap<String, FakeBehaviour>,
    next_pid: AtomicU32,
    registry: Mutex<Registry>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        FakeSpawner {
            behaviours: HashMap::new(),
            next_pid: AtomicU32::new(10_000),
            registry: Mutex::new(Registry::default()),
        }
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs without an explicit behaviour run forever.
    pub fn with(mut self, name: &str, behaviour: FakeBehaviour) -> Self {
        self.behaviours.insert(name.to_string(), behaviour);
        self
    }

    /// Terminates the current child of a slot from the outside, like a
    /// `kill` issued by an operator. Returns false if there is none.
    pub async fn kill(&self, name: &str, instance: usize, outcome: ExitOutcome) -> bool {
        let registry = self.registry.lock().await;
        match registry.kills.get(&(name.to_string(), instance)) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Launch attempts so far, failed ones included.
    pub async fn launches(&self, name: &str) -> usize {
        self.registry.lock().await.launches.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, spec: &ProcessSpec, instance: usize) -> io::Result<Box<dyn SupervisedChild>> {
        let behaviour = self
            .behaviours
            .get(&spec.name)
            .copied()
            .unwrap_or(FakeBehaviour::RunForever);

        let mut registry = self.registry.lock().await;
        *registry.launches.entry(spec.name.clone()).or_default() += 1;

        if behaviour == FakeBehaviour::FailLaunch {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such file or directory", spec.executable),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        registry.kills.insert((spec.name.clone(), instance), tx.clone());

        let deadline = match behaviour {
            FakeBehaviour::ExitAfter(after, outcome) => Some((Instant::now() + after, outcome)),
            _ => None,
        };
        Ok(Box::new(FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
            deadline,
            ignore_stop: behaviour == FakeBehaviour::IgnoreStopSignal,
        }))
    }
}

struct FakeChild {
    pid: u32,
    tx: mpsc::UnboundedSender<ExitOutcome>,
    rx: mpsc::UnboundedReceiver<ExitOutcome>,
    deadline: Option<(Instant, ExitOutcome)>,
    ignore_stop: bool,
}

#[async_trait]
impl SupervisedChild for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let deadline = self.deadline;
        tokio::select! {
            received = self.rx.recv() => {
                received.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "fake child vanished"))
            }
            outcome = async {
                match deadline {
                    Some((at, outcome)) => {
                        sleep_until(at).await;
                        outcome
                    }
                    None => std::future::pending().await,
                }
            } => Ok(outcome),
        }
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        if self.ignore_stop && signal != Signal::SIGKILL {
            return Ok(());
        }
        let _ = self.tx.send(ExitOutcome::Signal(signal as i32));
        Ok(())
    }
}
