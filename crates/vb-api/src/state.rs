use std::sync::Arc;

use vb_db::VpsStore;
use vb_infra::ContainerBackend;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VpsStore>,
    pub backend: Arc<dyn ContainerBackend>,
    pub config: AppConfig,
}
