use std::sync::Arc;
use std::time::Duration;

use hickory_server::proto::op::{Message, ResponseCode};
use hickory_server::proto::rr::RData;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::config::{Addr, Config};
use crate::upstream::Exchange;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no upstream servers to query")]
    NoUpstreams,
    #[error("no upstream answered within {0:?}")]
    Timeout(Duration),
}

/// Picks an upstream group for a query and races the group's members.
pub struct UpstreamResolver {
    config: Arc<Config>,
    exchange: Arc<dyn Exchange>,
}

impl UpstreamResolver {
    pub fn new(config: Arc<Config>, exchange: Arc<dyn Exchange>) -> Self {
        Self { config, exchange }
    }

    /// Scans the forward rules in order; the first rule whose domain set
    /// covers `name` wins. Everything else goes to the default upstreams.
    /// `name` must be lowercased with trailing dots trimmed.
    pub fn route(&self, name: &str) -> &[Addr] {
        for rule in &self.config.forward_rules {
            if rule.domains.contains(name) {
                return &rule.server;
            }
        }
        &self.config.default_upstream
    }

    /// Queries every server concurrently and returns the first response that
    /// is `NoError` and passes the blacklist filter. Rejected responses are
    /// kept so that on deadline expiry the client still sees *something*
    /// rather than nothing; only a fully silent race is an error.
    pub async fn race(&self, query: &Message, servers: &[Addr]) -> Result<Message, ResolveError> {
        if servers.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }

        let deadline = Instant::now() + self.config.race_timeout();
        let (tx, mut rx) = mpsc::channel(servers.len());
        for addr in servers {
            let exchange = Arc::clone(&self.exchange);
            let query = query.clone();
            let addr = addr.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match exchange.exchange(&query, &addr).await {
                    // A late result after the winner was consumed has no
                    // receiver left; the failed send is the drop.
                    Ok(reply) => {
                        let _ = tx.try_send(reply);
                    }
                    Err(err) => debug!("exchange with {addr} failed: {err:#}"),
                }
            });
        }
        drop(tx);

        let mut fallback = None;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => {
                    if reply.response_code() == ResponseCode::NoError && !self.blacklisted(&reply) {
                        return Ok(reply);
                    }
                    fallback = Some(reply);
                }
                // All upstreams are done; nothing more can arrive.
                Ok(None) => break,
                // Deadline expired with tasks still in flight.
                Err(_) => break,
            }
        }

        match fallback {
            Some(reply) => Ok(reply),
            None => Err(ResolveError::Timeout(self.config.race_timeout())),
        }
    }

    /// A response is rejected iff any A/AAAA answer carries a blacklisted
    /// address. Matching is exact; suffix semantics do not apply to IPs.
    fn blacklisted(&self, reply: &Message) -> bool {
        for answer in reply.answers() {
            let ip = match answer.data() {
                Some(RData::A(a)) => a.0.to_string(),
                Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
                _ => continue,
            };
            if self.config.blacklist.exists(&ip) {
                debug!("answer {ip} is blacklisted");
                return true;
            }
        }
        false
    }
}
