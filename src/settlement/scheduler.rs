// Worker Scheduler - runs each periodic settlement task on its own interval
//
// - One tokio task per worker, ticking on a fixed interval
// - Start is jittered so replicas don't hit the rails in lockstep
// - A failed cycle is logged and the next tick runs as usual
// - Shutdown is signalled through a watch channel

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{error, info};

/// A stateless unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run_once(&self) -> anyhow::Result<()>;
}

pub struct WorkerScheduler {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    max_jitter: Duration,
}

impl WorkerScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            max_jitter: Duration::from_secs(5),
        }
    }

    pub fn with_task(mut self, task: Arc<dyn PeriodicTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Start every task in the background
    pub fn start(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.tasks
            .into_iter()
            .map(|task| {
                let jitter = Self::jitter(self.max_jitter.min(task.interval()));
                tokio::spawn(Self::run_loop(task, jitter, shutdown.clone()))
            })
            .collect()
    }

    /// Wait for every worker to observe shutdown
    pub async fn join(handles: Vec<JoinHandle<()>>) {
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("❌ Worker task panicked: {:?}", e);
            }
        }
    }

    fn jitter(max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random::<u64>() % max_ms)
    }

    async fn run_loop(
        task: Arc<dyn PeriodicTask>,
        jitter: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = sleep(jitter) => {}
            _ = shutdown.changed() => return,
        }

        info!("⏰ {} running every {:?}", task.name(), task.interval());
        let mut ticker = interval(task.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = task.run_once().await {
                        error!("❌ {} cycle failed: {:?}", task.name(), e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("🛑 {} stopped", task.name());
                    return;
                }
            }
        }
    }
}

impl Default for WorkerScheduler {
    fn default() -> Self {
        Self::new()
    }
}
