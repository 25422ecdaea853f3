//! Fixed-cadence task runner.
//!
//! Each registered task runs in its own loop: wait the initial delay, run,
//! then sleep `interval` plus a random share of `jitter` after the run
//! finishes. Runs of the same task therefore never overlap, and a run that
//! panics is logged and retried at the next interval.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self);
}

struct Registration {
    task: Arc<dyn PeriodicTask>,
    initial_delay: Duration,
    interval: Duration,
    jitter: Duration,
}

#[derive(Default)]
pub struct Scheduler {
    registrations: Vec<Registration>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task: Arc<dyn PeriodicTask>,
        initial_delay: Duration,
        interval: Duration,
        jitter: Duration,
    ) -> &mut Self {
        self.registrations.push(Registration {
            task,
            initial_delay,
            interval,
            jitter,
        });
        self
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run(self) {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves; in-flight runs are aborted.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut set = JoinSet::new();
        for reg in self.registrations {
            info!(
                task = reg.task.name(),
                interval_secs = reg.interval.as_secs(),
                "scheduling periodic task"
            );
            set.spawn(run_loop(reg));
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Err(e)) => error!("periodic task stopped: {}", e),
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }
        set.shutdown().await;
    }
}

async fn run_loop(reg: Registration) {
    sleep(reg.initial_delay).await;
    loop {
        // Dropping the set on shutdown aborts an in-flight run.
        let mut current = JoinSet::new();
        let task = reg.task.clone();
        current.spawn(async move { task.run().await });
        if let Some(Err(e)) = current.join_next().await {
            error!(task = reg.task.name(), "periodic run failed: {}", e);
        }
        sleep(jittered(reg.interval, reg.jitter)).await;
    }
}

pub fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let max_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
