use crate::config::{Config, Network};
use crate::handler::ProxyHandler;
use crate::resolver::UpstreamResolver;
use crate::upstream::Exchange;
use anyhow::{Context, Result, bail};
use hickory_server::ServerFuture;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DnsServer {
    config: Arc<Config>,
    exchange: Arc<dyn Exchange>,
}

impl DnsServer {
    pub fn new(config: Arc<Config>, exchange: Arc<dyn Exchange>) -> Self {
        Self { config, exchange }
    }

    pub async fn run(self) -> Result<()> {
        if self.config.listen.is_empty() {
            bail!("no listen addresses configured");
        }

        let resolver = UpstreamResolver::new(Arc::clone(&self.config), self.exchange);
        let handler = ProxyHandler::new(Arc::clone(&self.config), resolver);
        let mut server = ServerFuture::new(handler);

        for addr in &self.config.listen {
            let endpoint = addr.endpoint();
            match addr.network {
                Network::Udp => {
                    let socket = UdpSocket::bind(endpoint.as_str())
                        .await
                        .with_context(|| format!("binding udp {endpoint}"))?;
                    server.register_socket(socket);
                    info!("listening on {endpoint}/udp");
                }
                Network::Tcp => {
                    let listener = TcpListener::bind(endpoint.as_str())
                        .await
                        .with_context(|| format!("binding tcp {endpoint}"))?;
                    server.register_listener(listener, TCP_QUERY_TIMEOUT);
                    info!("listening on {endpoint}/tcp");
                }
                Network::HttpsGoogle | Network::HttpsCloudflare => {
                    bail!("cannot listen on {addr}: https networks are upstream-only");
                }
            }
        }

        server.block_until_done().await?;
        Ok(())
    }
}
