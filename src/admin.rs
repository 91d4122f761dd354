//! Admin HTTP API for runtime blocklist management.
//!
//! Exposes blocklist inspection and mutation on an operator-facing
//! listener, separate from the protected traffic:
//!
//! - `GET /defender/blocklist` lists the effective file + dynamic entries
//! - `POST /defender/blocklist` adds CIDRs to the dynamic blocklist
//! - `DELETE /defender/blocklist/<cidr>` removes one CIDR
//! - `GET /defender/stats` reports configured ranges and per-source counts
//!
//! The API holds a handle to its defender instance; there is no global
//! registry. Mutations notify the composer before the response is
//! written, so a subsequent request from a just-blocked address is
//! already diverted.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::middleware::Defender;
use crate::responders::{full_body, BoxBody};
use crate::sources::SourceKind;

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    let body_str = serde_json::to_string(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body_str))
        .expect("static response construction cannot fail")
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    json_response(status, serde_json::json!({ "error": message }))
}

/// Start the admin API server. Runs until the listener fails.
pub async fn run_admin_server(bind_addr: SocketAddr, defender: Arc<Defender>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "defender admin API listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let defender = Arc::clone(&defender);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let defender = Arc::clone(&defender);
                async move {
                    Ok::<_, std::convert::Infallible>(handle_admin(req, &defender).await)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                if !e.to_string().contains("connection closed") {
                    warn!(peer = %peer, error = %e, "admin HTTP connection error");
                }
            }
        });
    }
}

/// Route an admin request. Exposed separately from the server loop so
/// hosts can mount it on an existing listener.
pub async fn handle_admin<B>(req: Request<B>, defender: &Defender) -> Response<BoxBody>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match path.as_str() {
        "/defender/blocklist" => match method {
            Method::GET => handle_get_blocklist(defender),
            Method::POST => handle_add_to_blocklist(req, defender).await,
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        },
        "/defender/stats" => match method {
            Method::GET => handle_stats(defender),
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        },
        p if p.starts_with("/defender/blocklist/") => match method {
            Method::DELETE => handle_remove_from_blocklist(p, defender),
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        },
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn handle_get_blocklist(defender: &Defender) -> Response<BoxBody> {
    let Some(dynamic) = defender.dynamic_blocklist() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "dynamic blocklist not enabled",
        );
    };

    let file_entries = defender
        .file_fetcher()
        .map(|f| f.snapshot())
        .unwrap_or_default();
    let dynamic_entries = dynamic.list();

    let ips: Vec<serde_json::Value> = file_entries
        .iter()
        .map(|ip| serde_json::json!({ "ip": ip, "source": SourceKind::File.as_str() }))
        .chain(dynamic_entries.iter().map(
            |ip| serde_json::json!({ "ip": ip, "source": SourceKind::Dynamic.as_str() }),
        ))
        .collect();

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "total": ips.len(),
            "sources": {
                "file": file_entries.len(),
                "dynamic": dynamic_entries.len(),
            },
            "ips": ips,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    #[serde(default)]
    ips: Vec<String>,
}

async fn handle_add_to_blocklist<B>(req: Request<B>, defender: &Defender) -> Response<BoxBody>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let Some(dynamic) = defender.dynamic_blocklist() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "dynamic blocklist not enabled",
        );
    };

    let bytes: Bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read admin request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let request: AddRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"));
        }
    };

    if request.ips.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no IPs provided");
    }
    for ip in &request.ips {
        if !ip.contains('/') {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("IP must be in CIDR format (e.g., {ip}/32): {ip}"),
            );
        }
    }

    let persist_error = dynamic.add(&request.ips).err();
    // The in-memory mutation holds even when persistence failed, so the
    // composer is notified either way.
    defender.composer().on_source_change();

    if let Some(e) = persist_error {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "added": request.ips,
            "count": request.ips.len(),
        }),
    )
}

fn handle_remove_from_blocklist(path: &str, defender: &Defender) -> Response<BoxBody> {
    let Some(dynamic) = defender.dynamic_blocklist() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "dynamic blocklist not enabled",
        );
    };

    // The CIDR itself contains a slash, so everything after the route
    // prefix is the entry.
    let cidr = path
        .trim_start_matches("/defender/blocklist/")
        .trim()
        .to_string();
    if cidr.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "CIDR required");
    }

    match dynamic.remove(&cidr) {
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            &format!("IP not found in blocklist: {cidr}"),
        ),
        Ok(true) => {
            defender.composer().on_source_change();
            json_response(StatusCode::OK, serde_json::json!({ "removed": cidr }))
        }
        Err(e) => {
            // Removed in memory; only the mirror write failed.
            defender.composer().on_source_change();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn handle_stats(defender: &Defender) -> Response<BoxBody> {
    let config = defender.config();
    let counts = defender.composer().counts();

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "configured_ranges": config.ranges,
            "blocklist_file": config
                .blocklist_file
                .as_ref()
                .map(|p| p.display().to_string()),
            "counts": {
                "configured_ranges": counts.configured_ranges,
                "file_ranges": counts.file_ranges,
                "dynamic_ranges": counts.dynamic_ranges,
                "total": counts.total(),
            },
            "responder": serde_json::to_value(&config.responder).unwrap_or_default(),
        }),
    )
}
