//! Outbound fetch.
//!
//! Hostnames are resolved up front, every resolved address is classified,
//! and the connection is pinned to exactly those addresses so a second
//! lookup cannot rebind the name to an internal target. Redirects are
//! never followed.

use bytes::{Bytes, BytesMut};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use capsule_core::config::EgressConfig;

use crate::address::classify_ip;
use crate::error::{EgressError, EgressResult};
use crate::headers::{apply_cors, filter_request_headers, filter_response_headers};
use crate::policy::EgressTarget;

/// Resolver backed by the system's `getaddrinfo` via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EgressRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct EgressResponse {
    pub status: StatusCode,
    /// Filtered upstream headers plus CORS.
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct EgressClient {
    resolver: Arc<dyn Resolve>,
    timeout: Duration,
    max_response_bytes: u64,
    user_agent: String,
}

impl EgressClient {
    pub fn new(config: &EgressConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &EgressConfig, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver,
            timeout: Duration::from_secs(config.timeout_secs),
            max_response_bytes: config.max_response_bytes,
            user_agent: config.user_agent.clone(),
        }
    }

    /// Resolve the target host and reject any internal address.
    pub async fn resolve_checked(&self, target: &EgressTarget) -> EgressResult<Vec<SocketAddr>> {
        if let Ok(ip) = target.host.parse::<IpAddr>() {
            return check_addr(&target.host, SocketAddr::new(ip, target.port)).map(|a| vec![a]);
        }
        let name: Name = target
            .host
            .parse()
            .map_err(|_| EgressError::InvalidUrl(format!("invalid host {}", target.host)))?;
        let resolved = tokio::time::timeout(self.timeout, self.resolver.resolve(name))
            .await
            .map_err(|_| EgressError::Timeout)?
            .map_err(|e| EgressError::Resolve {
                host: target.host.clone(),
                message: e.to_string(),
            })?;

        let addrs = resolved
            .map(|a| check_addr(&target.host, SocketAddr::new(a.ip(), target.port)))
            .collect::<EgressResult<Vec<_>>>()?;
        if addrs.is_empty() {
            return Err(EgressError::Resolve {
                host: target.host.clone(),
                message: "no addresses".into(),
            });
        }
        debug!(host = %target.host, count = addrs.len(), "egress target resolved");
        Ok(addrs)
    }

    /// One outbound call, no retry. Dropping the future cancels it.
    pub async fn fetch(&self, target: &EgressTarget, request: EgressRequest) -> EgressResult<EgressResponse> {
        let addrs = self.resolve_checked(target).await?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .no_proxy()
            .resolve_to_addrs(&target.host, &addrs)
            .build()
            .map_err(|e| EgressError::Client(e.to_string()))?;

        let mut builder = client
            .request(request.method.clone(), target.url.clone())
            .headers(filter_request_headers(&request.headers));
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let mut response = builder.send().await?;
        let status = response.status();

        if let Some(len) = response.content_length()
            && len > self.max_response_bytes
        {
            warn!(host = %target.host, len, "upstream response too large");
            return Err(EgressError::ResponseTooLarge {
                limit: self.max_response_bytes,
            });
        }
        let mut headers = filter_response_headers(response.headers());
        apply_cors(&mut headers);

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if (body.len() + chunk.len()) as u64 > self.max_response_bytes {
                warn!(host = %target.host, "upstream response too large");
                return Err(EgressError::ResponseTooLarge {
                    limit: self.max_response_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        info!(
            host = %target.host,
            method = %request.method,
            status = status.as_u16(),
            bytes = body.len(),
            "egress call completed"
        );
        Ok(EgressResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

fn check_addr(host: &str, addr: SocketAddr) -> EgressResult<SocketAddr> {
    match classify_ip(addr.ip()) {
        Some(reason) => {
            warn!(%host, ip = %addr.ip(), %reason, "egress target resolves to blocked address");
            Err(EgressError::Blocked {
                host: host.to_string(),
                reason,
            })
        }
        None => Ok(addr),
    }
}
