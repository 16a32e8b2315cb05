use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::session::SessionTransport;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub session: SessionTransport,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, session: SessionTransport) -> Self {
        Self {
            settings: Arc::new(settings),
            session,
            start_time: Instant::now(),
        }
    }
}
