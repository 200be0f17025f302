use std::sync::Arc;

use tokio::sync::Notify;

use crate::{config::AppConfig, pipeline::Pipeline};

#[derive(Clone)]
pub struct AppContext {
    config: Arc<AppConfig>,
    shutdown: Arc<Notify>,
    pipeline: Arc<Pipeline>,
}

impl AppContext {
    pub fn new(config: AppConfig, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
            pipeline,
        }
    }

    /// Builds the pipeline described by `config` and wraps both.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let pipeline = Pipeline::from_app_config(&config)?;
        Ok(Self::new(config, Arc::new(pipeline)))
    }

    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
