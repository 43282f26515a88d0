use std::sync::Arc;

use crate::config::Config;
use crate::lifecycle::Lifecycle;
use crate::queue::QueueManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: QueueManager,
    pub lifecycle: Lifecycle,
}
