//! Fixed-interval driver.
//!
//! Every tick fires the analysis and the development poll cycle as separate
//! tasks. A cycle that is still running when the next tick arrives is skipped
//! for that tick, so at most one analysis cycle and one development run are
//! ever in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipeline::{AnalysisPipeline, DevelopmentPipeline};

pub struct Driver {
    analysis: Arc<Mutex<AnalysisPipeline>>,
    development: Option<Arc<Mutex<DevelopmentPipeline>>>,
    interval: Duration,
}

impl Driver {
    /// `development` is `None` when the development columns are not configured.
    pub fn new(
        analysis: AnalysisPipeline,
        development: Option<DevelopmentPipeline>,
        interval: Duration,
    ) -> Self {
        Self {
            analysis: Arc::new(Mutex::new(analysis)),
            development: development.map(|d| Arc::new(Mutex::new(d))),
            interval,
        }
    }

    /// Starts one analysis cycle unless the previous one is still running.
    pub fn spawn_analysis(&self) -> Option<JoinHandle<()>> {
        let Ok(mut pipeline) = self.analysis.clone().try_lock_owned() else {
            tracing::info!("analysis cycle still running, skipping tick");
            return None;
        };
        Some(tokio::spawn(async move {
            if let Err(e) = pipeline.poll().await {
                tracing::error!(error = %e, "analysis poll failed");
            }
        }))
    }

    /// Starts one development cycle unless a development run is in progress.
    pub fn spawn_development(&self) -> Option<JoinHandle<()>> {
        let development = self.development.as_ref()?;
        let Ok(mut pipeline) = development.clone().try_lock_owned() else {
            tracing::info!("dev already in progress, skipping tick");
            return None;
        };
        Some(tokio::spawn(async move {
            if let Err(e) = pipeline.poll().await {
                tracing::error!(error = %e, "development poll failed");
            }
        }))
    }

    /// Fires both cycles on every tick until `shutdown` resolves.
    ///
    /// The first tick fires immediately. On shutdown, idle pipelines close
    /// their ledgers; runs still in flight are abandoned and their child
    /// processes killed when the runtime drops them.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = self.interval.as_secs(), "polling started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_analysis();
                    self.spawn_development();
                }
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn close(self) {
        match Arc::try_unwrap(self.analysis) {
            Ok(pipeline) => {
                if let Err(e) = pipeline.into_inner().close().await {
                    tracing::error!(error = %e, "failed to close analysis ledger");
                }
            }
            Err(_) => tracing::warn!("analysis cycle still running at shutdown"),
        }

        if let Some(development) = self.development {
            match Arc::try_unwrap(development) {
                Ok(pipeline) => {
                    if let Err(e) = pipeline.into_inner().close().await {
                        tracing::error!(error = %e, "failed to close development ledger");
                    }
                }
                Err(_) => tracing::warn!("development run still in progress at shutdown"),
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
