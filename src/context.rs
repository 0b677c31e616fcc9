use std::sync::Arc;

use crate::api::{self, BackupApi};
use crate::config::AppConfig;
use crate::core::Monitor;
use crate::error::ApiResult;
use crate::stream;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub api: Arc<dyn BackupApi>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> ApiResult<Self> {
        let api = api::create_api(&config)?;
        Ok(Self::with_api(config, api))
    }

    pub fn with_api(config: AppConfig, api: Arc<dyn BackupApi>) -> Self {
        Self {
            config: Arc::new(config),
            api,
        }
    }

    /// A monitor on the configured push endpoint, sharing this context's API client.
    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.api.clone(),
            stream::create_client(&self.config),
            &self.config,
        )
    }
}
