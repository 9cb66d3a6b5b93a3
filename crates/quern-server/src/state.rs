use std::sync::Arc;

use quern::GenerationCoordinator;
use quern::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<GenerationCoordinator>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(coordinator: GenerationCoordinator, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Arc::new(coordinator),
            settings: Arc::new(settings),
        })
    }
}
