pub mod forward_error;
pub mod forward_limits;
pub mod headers;
pub mod http;
pub mod listener;
pub mod plan;
pub mod request;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use rustls::client::ClientConfig;

use crate::{policy::AccessPolicy, settings::Settings};

/// Read-only state shared by every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub policy: Arc<AccessPolicy>,
    pub tls: Arc<ClientConfig>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, policy: Arc<AccessPolicy>, tls: Arc<ClientConfig>) -> Self {
        Self {
            settings,
            policy,
            tls,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    let listener = listener::start_listener(&app.settings).await?;
    listener::serve(listener, app).await
}
