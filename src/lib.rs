//! # Measurement Collector - Cloudflare Workers
//!
//! A data collection service accepting resumable uploads of telemetry
//! measurements from a fleet of mobile capture devices, built with Rust
//! and Cloudflare Workers. Binary payloads are streamed into R2 object
//! storage; metadata documents and upload-session state live in a D1
//! database; configuration is read from KV storage.
//!
//! ## Architecture
//!
//! - **Router**: Routes incoming requests to the protocol handlers
//! - **Middleware**: Validation, principal extraction and CORS
//! - **Handlers**: Pre-request and the resumable-upload state machine
//! - **Storage**: R2 blob store with append emulation and a staging area
//! - **Database**: D1 services for sessions and measurement documents
//! - **Reaper**: Scheduled reclamation of abandoned partial uploads
//!
//! ## Protocol
//!
//! The service speaks a two-phase resumable upload protocol:
//!
//! ```text
//! POST <prefix>/measurements                  - pre-request, returns the
//!                                               session Location
//! PUT  <prefix>/measurements/(<sessionId>)/   - chunk upload or status
//!                                               probe via Content-Range
//! GET  /health                                - health check
//! ```
//!
//! A client first announces metadata and the total size; the returned
//! `Location` embeds the upload session. Chunks then carry
//! `Content-Range: bytes <from>-<to>/<total>` headers and are streamed
//! into object storage; `308` replies tell the client where to resume,
//! and the final chunk commits the metadata document and replies `201`.

use std::sync::{Arc, OnceLock};
use worker::*;

mod config;
mod constants;
mod database;
mod errors;
mod handlers;
mod logging;
mod middleware;
mod models;
mod reaper;
mod router;
mod storage;
mod utils;

use config::Config;
use constants::CONFIG_KV_BINDING;

static CONFIG_CACHE: OnceLock<Arc<Config>> = OnceLock::new();

/// Main fetch entry point for the Cloudflare Worker.
///
/// Sets up panic reporting, loads the shared configuration, makes sure
/// the database schema exists and delegates routing. Configuration is
/// loaded once per isolate and shared via `Arc`.
#[event(fetch)]
pub async fn main(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    // Set up panic hook for better error reporting in development
    console_error_panic_hook::set_once();

    console_log!("Request: {} {}", req.method(), req.url()?.path());

    let config = load_config(&env).await?;

    if let Err(error) = database::ensure_schema_once(&env, &config.database_name).await {
        console_error!("Schema preparation failed: {}", error);
        return error.to_response();
    }

    router::handle_request(req, env, config).await
}

/// Scheduled entry point driving the partial-upload cleanup.
///
/// Runs on the cron trigger configured for the worker; the interval
/// should be at least the upload expiration window.
#[event(scheduled)]
pub async fn scheduled(_event: ScheduledEvent, env: Env, _ctx: ScheduleContext) {
    console_error_panic_hook::set_once();

    let config = match load_config(&env).await {
        Ok(config) => config,
        Err(error) => {
            console_error!("Cleanup aborted, configuration unavailable: {}", error);
            return;
        }
    };

    if let Err(error) = reaper::run(&env, &config).await {
        console_error!("Cleanup run failed: {}", error);
    }
}

async fn load_config(env: &Env) -> Result<Arc<Config>> {
    if let Some(config) = CONFIG_CACHE.get() {
        return Ok(config.clone());
    }

    let kv = env.kv(CONFIG_KV_BINDING)?;
    let config = Arc::new(Config::load(&kv).await?);
    let _ = CONFIG_CACHE.set(config.clone());
    Ok(config)
}
