use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_server::proto::op::Message;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::{Addr, Network};

const UDP_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_TIMEOUT: Duration = Duration::from_secs(8);
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

// Receive buffer sized for EDNS-announcing upstreams, not the classic 512.
const MAX_UDP_PAYLOAD: usize = 4096;

const GOOGLE_DOH_URL: &str = "https://dns.google/dns-query";
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// A single query/response exchange against one upstream resolver.
///
/// Implementations carry their own per-transport timeouts; the racing
/// resolver enforces the aggregate deadline on top.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, query: &Message, addr: &Addr) -> Result<Message>;
}

/// The real transports, shared by every in-flight query.
pub struct Transports {
    http: reqwest::Client,
}

impl Transports {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .context("building https client")?;
        Ok(Self { http })
    }

    async fn exchange_udp(&self, wire: &[u8], endpoint: &str) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(wire, endpoint).await?;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        let (len, _) = socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(&self, wire: &[u8], endpoint: &str) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(endpoint).await?;

        let len = u16::try_from(wire.len()).context("query too large for tcp framing")?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(wire).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn exchange_doh(&self, wire: Vec<u8>, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(wire)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    fn cloudflare_url(addr: &Addr) -> String {
        format!("https://{}/dns-query", addr.host)
    }
}

#[async_trait]
impl Exchange for Transports {
    async fn exchange(&self, query: &Message, addr: &Addr) -> Result<Message> {
        let wire = query.to_vec().context("encoding query")?;

        debug!("forward to {addr}");
        let reply_wire = match addr.network {
            Network::Udp => {
                let endpoint = addr.endpoint();
                timeout(UDP_TIMEOUT, self.exchange_udp(&wire, &endpoint))
                    .await
                    .with_context(|| format!("udp exchange with {endpoint} timed out"))??
            }
            Network::Tcp => {
                let endpoint = addr.endpoint();
                timeout(TCP_TIMEOUT, self.exchange_tcp(&wire, &endpoint))
                    .await
                    .with_context(|| format!("tcp exchange with {endpoint} timed out"))??
            }
            // The Google-style endpoint is baked in; addr.host is not used.
            Network::HttpsGoogle => self.exchange_doh(wire, GOOGLE_DOH_URL).await?,
            Network::HttpsCloudflare => {
                self.exchange_doh(wire, &Self::cloudflare_url(addr)).await?
            }
        };

        Message::from_vec(&reply_wire)
            .with_context(|| format!("decoding response from {addr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_server::proto::op::{MessageType, OpCode, Query};
    use hickory_server::proto::rr::{Name, RecordType};

    fn test_query() -> Message {
        let mut query = Message::new();
        query
            .set_id(42)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_ascii("example.com.").unwrap(),
                RecordType::A,
            ));
        query
    }

    fn canned_reply(query: &Message) -> Vec<u8> {
        let mut reply = Message::new();
        reply
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query);
        for q in query.queries() {
            reply.add_query(q.clone());
        }
        reply.to_vec().unwrap()
    }

    #[test]
    fn cloudflare_url_uses_the_host() {
        let addr = Addr {
            host: "cloudflare-dns.com".into(),
            port: 0,
            network: Network::HttpsCloudflare,
        };
        assert_eq!(
            Transports::cloudflare_url(&addr),
            "https://cloudflare-dns.com/dns-query"
        );
    }

    #[tokio::test]
    async fn udp_exchange_round_trips() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();
            server.send_to(&canned_reply(&query), peer).await.unwrap();
        });

        let transports = Transports::new().unwrap();
        let addr = Addr {
            host: "127.0.0.1".into(),
            port,
            network: Network::Udp,
        };
        let reply = transports.exchange(&test_query(), &addr).await.unwrap();

        assert_eq!(reply.id(), 42);
        assert_eq!(reply.message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn tcp_exchange_uses_length_prefix_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
            stream.read_exact(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf).unwrap();

            let reply = canned_reply(&query);
            let len = u16::try_from(reply.len()).unwrap();
            stream.write_all(&len.to_be_bytes()).await.unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let transports = Transports::new().unwrap();
        let addr = Addr {
            host: "127.0.0.1".into(),
            port,
            network: Network::Tcp,
        };
        let reply = transports.exchange(&test_query(), &addr).await.unwrap();

        assert_eq!(reply.id(), 42);
        assert_eq!(reply.queries().len(), 1);
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_error() {
        let transports = Transports::new().unwrap();
        let addr = Addr {
            host: "127.0.0.1".into(),
            port: 1,
            network: Network::Tcp,
        };
        assert!(transports.exchange(&test_query(), &addr).await.is_err());
    }
}
