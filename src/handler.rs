use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_server::proto::rr::{RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use log::{debug, error, warn};

use crate::config::Config;
use crate::resolver::UpstreamResolver;

// Host-table answers are static, so a long TTL is fine.
const HOSTS_TTL: u32 = 3600;

pub struct ProxyHandler {
    config: Arc<Config>,
    resolver: UpstreamResolver,
}

impl ProxyHandler {
    pub fn new(config: Arc<Config>, resolver: UpstreamResolver) -> Self {
        Self { config, resolver }
    }

    /// DNS names are case-insensitive on the wire; the suffix sets and the
    /// host table are case-exact, so normalization happens here.
    fn normalize_name(name: &str) -> String {
        name.trim_end_matches('.').to_ascii_lowercase()
    }

    fn build_upstream_query(request: &Request) -> Message {
        let request_info = request.request_info();
        let mut query = Message::new();
        query
            .set_id(request_info.header.id())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(request_info.query.original().clone());
        query
    }

    async fn handle_query<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let request_info = request.request_info();
        let query_name = request_info.query.name();
        let query_type = request_info.query.query_type();
        let name = Self::normalize_name(&query_name.to_string());

        let builder = MessageResponseBuilder::from_message_request(request);

        // Hosts short-circuit: a static override answers without touching
        // the network.
        if let Some(ip) = self.config.hosts.get(&name, query_type) {
            debug!("query {name} {query_type}, reply from hosts");
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A(v4.into()),
                IpAddr::V6(v6) => RData::AAAA(v6.into()),
            };
            let records = vec![Record::from_rdata(
                query_name.clone().into(),
                HOSTS_TTL,
                rdata,
            )];
            let mut header = Header::response_from_request(request_info.header);
            header.set_response_code(ResponseCode::NoError);
            header.set_authoritative(true);
            let response = builder.build(header, records.iter(), &[], &[], &[]);
            return match response_handle.send_response(response).await {
                Ok(info) => info,
                Err(e) => {
                    error!("failed to send DNS response: {e:#}");
                    ResponseInfo::from(*request_info.header)
                }
            };
        }

        let mut servers = self.resolver.route(&name);
        if servers.is_empty() {
            servers = &self.config.default_upstream;
        }

        let upstream_query = Self::build_upstream_query(request);
        match self.resolver.race(&upstream_query, servers).await {
            Ok(reply) => {
                debug!("query {name} {query_type}, reply from upstream");
                let mut header = Header::response_from_request(request_info.header);
                header.set_response_code(reply.response_code());
                header.set_recursion_available(true);
                let response = builder.build(
                    header,
                    reply.answers().iter(),
                    reply.name_servers().iter(),
                    &[],
                    // EDNS negotiation is between us and the upstream; the
                    // client gets the plain sections.
                    reply
                        .additionals()
                        .iter()
                        .filter(|record| record.record_type() != RecordType::OPT),
                );
                match response_handle.send_response(response).await {
                    Ok(info) => info,
                    Err(e) => {
                        error!("failed to send DNS response: {e:#}");
                        ResponseInfo::from(*request_info.header)
                    }
                }
            }
            Err(err) => {
                warn!("query {name} {query_type}: {err}");
                let response = builder.error_msg(request_info.header, ResponseCode::ServFail);
                match response_handle.send_response(response).await {
                    Ok(info) => info,
                    Err(e) => {
                        error!("failed to send DNS failure response: {e:#}");
                        ResponseInfo::from(*request_info.header)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ProxyHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let header = request.request_info().header;
        match header.message_type() {
            MessageType::Query => self.handle_query(request, response_handle).await,
            MessageType::Response => {
                error!("unexpected message type: Response. Dropping request.");
                ResponseInfo::from(*request.request_info().header)
            }
        }
    }
}
