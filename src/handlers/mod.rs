//! # Handlers Module
//!
//! HTTP request handlers for the measurement collector. The dispatch here
//! maps the two protocol endpoints onto their handlers and converts
//! application errors into wire responses; everything protocol-specific
//! lives in the [`pre_request`] and [`upload`] submodules.

use serde_json::json;
use std::sync::Arc;
use worker::*;

use crate::config::Config;
use crate::logging::Logger;
use crate::middleware::CorsMiddleware;
use crate::utils::session_id_from_path;

pub mod pre_request;
pub mod upload;

/// Dispatches the measurement endpoints nested under the API prefix.
///
/// - `POST <prefix>/measurements`: pre-request opening a session
/// - `PUT <prefix>/measurements/(<sessionId>)/`: chunk upload or probe
pub async fn handle_measurement_routes(
    req: Request,
    env: Env,
    config: Arc<Config>,
) -> Result<Response> {
    let logger = Logger::for_request();
    let method = req.method();
    let url = req.url()?;
    let path = url.path().to_string();

    let route = path
        .strip_prefix(&format!("{}/measurements", config.api_endpoint))
        .map(str::to_string);

    let result = match (method, route.as_deref()) {
        (Method::Post, Some("") | Some("/")) => {
            pre_request::handle_pre_request(req, &env, &config, &logger).await
        }
        (Method::Put, Some(rest)) if session_id_from_path(rest).is_some() => {
            upload::handle_upload(req, &env, &config, &logger).await
        }
        _ => return handle_not_found(req, env).await,
    };

    match result {
        Ok(response) => Ok(CorsMiddleware::apply_headers(response)),
        Err(error) => {
            let status = error.status().as_u16();
            let detail = json!({
                "path": path,
                "status": status,
                "error": error.to_string(),
            });
            if status >= 500 {
                logger.error("Request failed", Some(detail));
            } else {
                logger.warn("Request rejected", Some(detail));
            }

            match error.to_response() {
                Ok(response) => Ok(CorsMiddleware::apply_headers(response)),
                Err(_) => Response::error("Internal Server Error", 500)
                    .map(CorsMiddleware::apply_headers),
            }
        }
    }
}

/// Provides a health check endpoint for monitoring and load balancer probes.
pub async fn handle_health_check(_req: Request, _env: Env) -> Result<Response> {
    Response::from_json(&serde_json::json!({
        "status": "healthy",
        "service": "measurement-collector-cf-workers",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Handles requests to unmatched routes with a 404 Not Found response.
pub async fn handle_not_found(_req: Request, _env: Env) -> Result<Response> {
    Response::error("Not Found", 404)
}
