// Application state for HTTP handlers
use crate::application::session_registry::SessionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}
