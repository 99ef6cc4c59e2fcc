//! HTTP server
//!
//! `GET /` is answered directly. `GET /users/` needs data: the server asks
//! the node's database client for it and answers once the query completes.
//! Everything else is a 404.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::protocols::{split_url, HttpMethod, HttpPacket, Payload, HTTP_NOT_FOUND, HTTP_OK};
use crate::software::{
    DatabaseQuery, InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent,
};

#[derive(Debug, Clone)]
struct AwaitingData {
    client: InboundPayload,
    request_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WebServer {
    last_response_status_code: Option<u16>,
    awaiting: BTreeMap<u64, AwaitingData>,
}

impl WebServer {
    pub fn last_response_status_code(&self) -> Option<u16> {
        self.last_response_status_code
    }

    fn respond(&mut self, ctx: &mut NodeContext, client: &InboundPayload, request_id: u64, status_code: u16) {
        self.last_response_status_code = Some(status_code);
        ctx.send(OutboundPayload::reply_to(
            client,
            Payload::Http(HttpPacket::Response { status_code, request_id }),
        ));
    }
}

impl SoftwareBehaviour for WebServer {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Http(HttpPacket::Request { method, url, request_id }) = &inbound.payload else {
            return false;
        };
        let (_, path) = split_url(url);
        ctx.sys_log.info(format!("{}: {:?} {} from {}", core.name, method, path, inbound.src_ip_address));

        if *method != HttpMethod::Get {
            self.respond(ctx, inbound, *request_id, HTTP_NOT_FOUND);
            return true;
        }
        if path == "/" {
            self.respond(ctx, inbound, *request_id, HTTP_OK);
        } else if path.starts_with("/users") {
            let query_id = ctx.next_id();
            self.awaiting.insert(
                query_id,
                AwaitingData {
                    client: inbound.clone(),
                    request_id: *request_id,
                },
            );
            ctx.emit(SoftwareEvent::DatabaseQueryRequested(DatabaseQuery {
                requester: core.name.clone(),
                request_id: query_id,
                query: "SELECT".to_string(),
                server_ip_address: None,
                server_password: None,
            }));
        } else {
            self.respond(ctx, inbound, *request_id, HTTP_NOT_FOUND);
        }
        true
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        if let SoftwareEvent::DatabaseQueryCompleted {
            requester,
            request_id,
            success,
        } = event
        {
            if *requester == core.name {
                if let Some(awaiting) = self.awaiting.remove(request_id) {
                    let status_code = if *success { HTTP_OK } else { HTTP_NOT_FOUND };
                    self.respond(ctx, &awaiting.client, awaiting.request_id, status_code);
                }
            }
        }
        false
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert(
            "last_response_status_code".to_string(),
            self.last_response_status_code.map_or(Value::Null, Value::from),
        );
    }
}
