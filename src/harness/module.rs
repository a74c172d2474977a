use super::{DeathReason, Heart};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::lock::Mutex;
use jatsl::{JobScheduler, State, StatusServer};
use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Reason why a module has been terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// Startup routine threw an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// Core run loop threw an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] provided by module died
    #[error("heart provided by module died: {0}")]
    HeartDied(DeathReason),
    /// Run loop exited cleanly
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Timeout during startup or shutdown
    #[error("timeout during startup or shutdown")]
    Timeout,
}

/// Executable module
#[async_trait]
pub trait Module {
    /// Executed before running the core loop
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Core run loop of the module
    ///
    /// When the function returns `Some(_)` the death of the returned [`Heart`] is awaited before calling the shutdown hook.
    /// Returning `None` results in the module entering its shutdown sequence right away.
    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError>;

    /// Opportunity for modules to do something before all jobs will be terminated
    async fn pre_shutdown(&mut self, _scheduler: &JobScheduler) {}

    /// Shutdown hook executed after the core loop and all associated jobs have terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        match termination_reason {
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally => {
                info!("Module exited normally")
            }
            _ => error!("Module terminated with an error"),
        }
    }
}

/// Runner for [`Module`] implementations
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    status_server_port: Option<u16>,
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            status_server_port: None,
        }
    }
}

impl ModuleRunner {
    /// Enables the status server which can be used as a readiness probe
    pub fn with_status_server(mut self, port: u16) -> Self {
        self.status_server_port = Some(port);
        self
    }

    /// Limits the time spent in [`Module::pre_startup`]
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Limits the time spent in the shutdown sequence
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Executes a [`Module`] until it exits by calling the corresponding lifecycle functions in order
    /// and returns the reason why it terminated.
    #[instrument(skip(self, module), fields(module_name = type_name::<M>()))]
    pub async fn run<M: Module + Send + Sync>(&self, mut module: M) -> ModuleTerminationReason {
        let scheduler = JobScheduler::default();

        let status_state = if let Some(port) = self.status_server_port {
            info!(port, "Spawning status server");
            let (status_state, status_server) = StatusServer::new(&scheduler, port);
            scheduler.spawn_job(status_server).await;
            Some(status_state)
        } else {
            None
        };

        info!("Commencing module startup sequence");
        let termination_reason = match timeout(self.startup_timeout, module.pre_startup()).await {
            Ok(Ok(_)) => Self::run_loop(&mut module, &scheduler, &status_state).await,
            Ok(Err(error)) => {
                error!(?error, "Module startup sequence encountered an error");
                ModuleTerminationReason::StartupFailed(error)
            }
            Err(_) => {
                error!("Module startup sequence timed out");
                ModuleTerminationReason::Timeout
            }
        };

        info!("Running pre-shutdown hook");
        if let Some(state) = status_state {
            *state.lock().await = State::Shutdown;
        }
        module.pre_shutdown(&scheduler).await;

        info!("Terminating remaining jobs");
        scheduler.terminate_jobs(Duration::from_secs(5)).await;

        info!("Commencing module shutdown sequence");
        let result = timeout(self.shutdown_timeout, module.post_shutdown(&termination_reason)).await;

        if result.is_err() {
            error!("Module shutdown sequence timed out");
            return ModuleTerminationReason::Timeout;
        }

        termination_reason
    }

    async fn run_loop<M: Module + Send + Sync>(
        module: &mut M,
        scheduler: &JobScheduler,
        status_state: &Option<Arc<Mutex<State>>>,
    ) -> ModuleTerminationReason {
        info!("Executing module run procedure");
        match module.run(scheduler).await {
            Ok(None) => {
                debug!("Module run procedure completed successfully");
                if let Some(state) = status_state {
                    *state.lock().await = State::Running;
                }
                ModuleTerminationReason::ExitedNormally
            }
            Ok(Some(mut heart)) => {
                debug!("Module run procedure completed successfully, entering run loop");
                if let Some(state) = status_state {
                    *state.lock().await = State::Running;
                }
                let death_reason = heart.death().await;
                info!(?death_reason, "Heart provided by run procedure died");
                ModuleTerminationReason::HeartDied(death_reason)
            }
            Err(error) => {
                info!(?error, "Module run procedure encountered an error");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}
