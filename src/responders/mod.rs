//! Responders: what a diverted request receives instead of the next
//! handler's response.

pub mod tarpit;

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use crate::config::ResponderConfig;
use crate::error::{DefenderError, Result};

/// Response body type shared across the middleware, responders, and the
/// admin API.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    BoxBody::new(Full::new(data.into()))
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .expect("static response construction cannot fail")
}

/// Handles a request whose client address matched the blocklist.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self) -> Response<BoxBody>;
}

/// 403 with a fixed denial body.
#[derive(Debug, Default)]
pub struct BlockResponder;

#[async_trait]
impl Responder for BlockResponder {
    async fn respond(&self) -> Response<BoxBody> {
        text_response(StatusCode::FORBIDDEN, "Access denied")
    }
}

/// Fixed message with a configurable status code.
#[derive(Debug)]
pub struct CustomResponder {
    message: String,
    status: StatusCode,
}

impl CustomResponder {
    pub fn new(message: impl Into<String>, status: u16) -> Result<CustomResponder> {
        let status = StatusCode::from_u16(status).map_err(|_| {
            DefenderError::InvalidResponder(format!("invalid status code: {status}"))
        })?;
        Ok(CustomResponder {
            message: message.into(),
            status,
        })
    }
}

#[async_trait]
impl Responder for CustomResponder {
    async fn respond(&self) -> Response<BoxBody> {
        text_response(self.status, &self.message)
    }
}

/// Construct the responder a config names. Tarpit parameters are
/// validated here, at load time.
pub fn build(config: &ResponderConfig) -> Result<Arc<dyn Responder>> {
    match config {
        ResponderConfig::Block => Ok(Arc::new(BlockResponder)),
        ResponderConfig::Custom { message, status } => {
            Ok(Arc::new(CustomResponder::new(message.clone(), *status)?))
        }
        ResponderConfig::Tarpit(tarpit_config) => Ok(Arc::new(tarpit::TarpitResponder::new(
            tarpit_config.clone(),
        )?)),
    }
}
