pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod routes;
pub mod services;
pub mod store;

use std::sync::Arc;

use config::Config;
use gateway::Gateway;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
}
