//! # Request Routing and Dispatch
//!
//! Pattern-based routing for the measurement collector. CORS preflight
//! requests are answered early, the health endpoint serves monitoring
//! probes, and everything under the configured API prefix is delegated to
//! the measurement handlers. Unmatched routes get a 404.

use std::sync::Arc;
use worker::*;

use crate::config::Config;
use crate::handlers::{handle_health_check, handle_measurement_routes, handle_not_found};
use crate::middleware::CorsMiddleware;

/// Handles incoming HTTP requests and routes them to appropriate handlers.
pub async fn handle_request(req: Request, env: Env, config: Arc<Config>) -> Result<Response> {
    // Handle CORS preflight requests early to avoid unnecessary processing
    if req.method() == Method::Options {
        return CorsMiddleware::handle_preflight();
    }

    let url = req.url()?;
    let path = url.path();
    let method = req.method();

    console_log!("Routing request: {} {}", method, path);

    match (method, path) {
        // Health check endpoint for monitoring and load balancer probes
        (Method::Get, "/health") => handle_health_check(req, env).await,

        // Everything under the API prefix belongs to the upload protocol
        (_, path) if path.starts_with(&config.api_endpoint) => {
            handle_measurement_routes(req, env, config.clone()).await
        }

        // Default 404 handler for unmatched routes
        _ => handle_not_found(req, env).await,
    }
}
