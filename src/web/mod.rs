//! Web server module (Axum + API).

pub mod api;
pub mod error;
pub mod router;
pub mod server;

use std::sync::Arc;

use crate::core::RoutingFacade;

pub use error::{ApiError, ApiJson, Credential};
pub use server::{build_facade, run_server};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<RoutingFacade>,
    /// Page size used when a request gives none.
    pub default_limit: u32,
}

impl AppState {
    pub fn new(facade: Arc<RoutingFacade>, default_limit: u32) -> Self {
        Self {
            facade,
            default_limit,
        }
    }
}
