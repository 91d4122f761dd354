//! The defender middleware: per-request admission and wiring.
//!
//! [`Defender`] ties together the configuration, the composed blocklist,
//! and the responder. Hosts embed it in front of their handler chain:
//! parse nothing themselves, hand over the transport-level remote
//! address, and either forward to the next handler or let the configured
//! responder answer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Request, Response, StatusCode};
use tracing::{debug, error};

use crate::checker::IpChecker;
use crate::composer::BlocklistComposer;
use crate::config::DefenderConfig;
use crate::error::Result;
use crate::responders::{self, text_response, BoxBody, Responder};
use crate::sources::dynamic::DynamicBlocklist;
use crate::sources::file::FileFetcher;

/// Outcome of the per-request address check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request to the next handler.
    Forward,
    /// Dispatch the configured responder.
    Divert,
    /// The remote address could not be parsed; deny outright.
    Reject,
}

/// One defender instance: configuration, rule sources, checker, and
/// responder.
pub struct Defender {
    config: DefenderConfig,
    checker: Arc<IpChecker>,
    composer: Arc<BlocklistComposer>,
    file: Option<Arc<FileFetcher>>,
    dynamic: Option<Arc<DynamicBlocklist>>,
    responder: Arc<dyn Responder>,
}

impl Defender {
    /// Validate the configuration, load all sources, and start the file
    /// watcher. Must be called from within a tokio runtime. Any
    /// configuration or initial-load failure aborts startup.
    pub async fn new(config: DefenderConfig) -> Result<Arc<Defender>> {
        let static_ranges = config.validate()?;
        let responder = responders::build(&config.responder)?;

        let dynamic = if config.dynamic_blocklist {
            let dynamic = Arc::new(DynamicBlocklist::new());
            if let Some(path) = &config.persist_dynamic_to {
                dynamic.enable_file_persistence(path)?;
            }
            Some(dynamic)
        } else {
            None
        };

        let file = match &config.blocklist_file {
            Some(path) => Some(FileFetcher::new(path)?),
            None => None,
        };

        let checker = Arc::new(IpChecker::new(&Vec::new(), &config.whitelist));
        let composer = BlocklistComposer::new(
            static_ranges,
            file.clone(),
            dynamic.clone(),
            Arc::clone(&checker),
        );

        if let Some(fetcher) = &file {
            let composer = Arc::clone(&composer);
            fetcher.start_watching(Box::new(move |_snapshot| composer.on_source_change()))?;
        }

        Ok(Arc::new(Defender {
            config,
            checker,
            composer,
            file,
            dynamic,
            responder,
        }))
    }

    /// Decide what to do with a request from `remote_addr`
    /// (`host:port`, IPv6 hosts in brackets).
    ///
    /// A remote address that does not split or parse is rejected rather
    /// than forwarded: a malformed peer address means either upstream
    /// misconfiguration or a probing client, and both are safer denied.
    pub fn decide(&self, remote_addr: &str) -> Decision {
        let Ok(peer) = remote_addr.parse::<SocketAddr>() else {
            error!(addr = remote_addr, "invalid client address format");
            return Decision::Reject;
        };
        let ip = peer.ip();
        debug!(ip = %ip, "checking client IP");
        if self.checker.allowed(ip) {
            Decision::Forward
        } else {
            Decision::Divert
        }
    }

    /// Handle one request: forward to `next` when the client is allowed,
    /// otherwise answer with the configured responder.
    pub async fn handle<B, N, Fut>(
        &self,
        req: Request<B>,
        remote_addr: &str,
        next: N,
    ) -> Response<BoxBody>
    where
        N: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = Response<BoxBody>>,
    {
        match self.decide(remote_addr) {
            Decision::Forward => next(req).await,
            Decision::Divert => self.responder.respond().await,
            Decision::Reject => text_response(StatusCode::FORBIDDEN, "invalid client address"),
        }
    }

    /// Release the file watcher. Idempotent.
    pub fn close(&self) {
        if let Some(fetcher) = &self.file {
            fetcher.close();
        }
    }

    pub fn config(&self) -> &DefenderConfig {
        &self.config
    }

    pub fn checker(&self) -> &Arc<IpChecker> {
        &self.checker
    }

    pub fn composer(&self) -> &Arc<BlocklistComposer> {
        &self.composer
    }

    pub fn file_fetcher(&self) -> Option<&Arc<FileFetcher>> {
        self.file.as_ref()
    }

    pub fn dynamic_blocklist(&self) -> Option<&Arc<DynamicBlocklist>> {
        self.dynamic.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponderConfig;
    use http_body_util::BodyExt;

    fn config(ranges: &[&str]) -> DefenderConfig {
        DefenderConfig {
            ranges: ranges.iter().map(|s| s.to_string()).collect(),
            blocklist_file: None,
            whitelist: Vec::new(),
            dynamic_blocklist: true,
            persist_dynamic_to: None,
            responder: ResponderConfig::Block,
        }
    }

    async fn next_ok(_req: Request<String>) -> Response<BoxBody> {
        text_response(StatusCode::OK, "next handler")
    }

    #[tokio::test]
    async fn blocked_client_gets_responder() {
        let defender = Defender::new(config(&["10.0.0.0/8"])).await.unwrap();

        let req = Request::builder().body(String::new()).unwrap();
        let response = defender.handle(req, "10.1.2.3:5000", next_ok).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Access denied");
    }

    #[tokio::test]
    async fn allowed_client_is_forwarded() {
        let defender = Defender::new(config(&["10.0.0.0/8"])).await.unwrap();

        let req = Request::builder().body(String::new()).unwrap();
        let response = defender.handle(req, "11.0.0.1:5000", next_ok).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_remote_addr_fails_closed() {
        let defender = Defender::new(config(&["10.0.0.0/8"])).await.unwrap();

        assert_eq!(defender.decide("not-an-address"), Decision::Reject);
        assert_eq!(defender.decide("10.0.0.1"), Decision::Reject); // no port
        let req = Request::builder().body(String::new()).unwrap();
        let response = defender.handle(req, "garbage", next_ok).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ipv6_remote_addr_supported() {
        let defender = Defender::new(config(&["2001:db8::/32"])).await.unwrap();

        assert_eq!(defender.decide("[2001:db8::1]:443"), Decision::Divert);
        assert_eq!(defender.decide("[2001:db9::1]:443"), Decision::Forward);
    }

    #[tokio::test]
    async fn whitelist_short_circuits() {
        let mut cfg = config(&["10.0.0.0/8"]);
        cfg.whitelist = vec!["10.0.0.5".to_string()];
        let defender = Defender::new(cfg).await.unwrap();

        assert_eq!(defender.decide("10.0.0.5:1234"), Decision::Forward);
        assert_eq!(defender.decide("10.0.0.6:1234"), Decision::Divert);
    }

    #[tokio::test]
    async fn invalid_static_range_aborts_startup() {
        assert!(Defender::new(config(&["10.0.0.0/40"])).await.is_err());
    }
}
