//! Database client
//!
//! Holds one connection to a database server. Queries arriving before the
//! connection is up are queued and sent once the server accepts. Other
//! software on the node (the web server, the data manipulation bot) queries
//! through this client with `DatabaseQueryRequested`.
//!
//! A connect request or query still unanswered when the network goes quiet
//! was lost on the way; its queries fail and the next query reconnects.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use super::ExecuteOutcome;
use crate::error::ConfigError;
use crate::frame::POSTGRES_PORT;
use crate::protocols::{DatabasePacket, Payload, HTTP_OK, HTTP_UNAUTHORIZED};
use crate::software::{
    DatabaseQuery, InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent,
    SoftwareOptions,
};

#[derive(Debug, Clone, Default)]
pub struct DatabaseClient {
    pub server_ip_address: Option<Ipv4Addr>,
    pub server_password: Option<String>,
    connection_id: Option<u64>,
    connection_request_id: Option<u64>,
    queued: VecDeque<DatabaseQuery>,
    in_flight: BTreeMap<u64, DatabaseQuery>,
    last_query_success: Option<bool>,
}

impl DatabaseClient {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            server_ip_address: options.ip("server_ip")?,
            server_password: options.string("server_password")?,
            ..Self::default()
        })
    }

    pub fn configure(&mut self, server_ip_address: Ipv4Addr, server_password: Option<String>) {
        self.server_ip_address = Some(server_ip_address);
        self.server_password = server_password;
        self.connection_id = None;
        self.connection_request_id = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }

    pub fn last_query_succeeded(&self) -> bool {
        self.last_query_success == Some(true)
    }

    /// Agent-triggered SELECT
    pub fn execute(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> ExecuteOutcome {
        let request_id = ctx.next_id();
        let query = DatabaseQuery {
            requester: core.name.clone(),
            request_id,
            query: "SELECT".to_string(),
            server_ip_address: None,
            server_password: None,
        };
        if self.query(core, ctx, query) {
            ExecuteOutcome::Pending
        } else {
            ExecuteOutcome::Completed(false)
        }
    }

    /// Send `query`, connecting first if needed; false if it failed at once
    pub fn query(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, query: DatabaseQuery) -> bool {
        if let Some(server_ip_address) = query.server_ip_address {
            if self.server_ip_address != Some(server_ip_address) || self.server_password != query.server_password {
                self.configure(server_ip_address, query.server_password.clone());
            }
        }
        let Some(server_ip_address) = self.server_ip_address else {
            ctx.sys_log.warning(format!("{}: no database server configured", core.name));
            self.complete(core, ctx, &query, false);
            return false;
        };
        match self.connection_id {
            Some(connection_id) => self.send_sql(ctx, server_ip_address, connection_id, query),
            None => {
                self.queued.push_back(query);
                self.connect(core, ctx, server_ip_address);
            }
        }
        true
    }

    fn connect(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, server_ip_address: Ipv4Addr) {
        if self.connection_request_id.is_some() {
            return;
        }
        let connection_request_id = ctx.next_id();
        ctx.sys_log.info(format!("{}: connecting to {}", core.name, server_ip_address));
        self.connection_request_id = Some(connection_request_id);
        ctx.send(OutboundPayload::tcp(
            Payload::Database(DatabasePacket::ConnectRequest {
                connection_request_id,
                password: self.server_password.clone(),
            }),
            server_ip_address,
            POSTGRES_PORT,
        ));
    }

    fn send_sql(&mut self, ctx: &mut NodeContext, server_ip_address: Ipv4Addr, connection_id: u64, query: DatabaseQuery) {
        let query_id = ctx.next_id();
        ctx.send(OutboundPayload::tcp(
            Payload::Database(DatabasePacket::Sql {
                query: query.query.clone(),
                query_id,
                connection_id,
            }),
            server_ip_address,
            POSTGRES_PORT,
        ));
        self.in_flight.insert(query_id, query);
    }

    /// Fail every query whose connect request or SQL reply never arrived
    fn abandon_outstanding(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) {
        if self.connection_request_id.take().is_some() {
            ctx.sys_log.warning(format!(
                "{}: connect request went unanswered, failing {} queued query(s)",
                core.name,
                self.queued.len()
            ));
            let queued: Vec<DatabaseQuery> = self.queued.drain(..).collect();
            for query in queued {
                self.complete(core, ctx, &query, false);
            }
        }
        if !self.in_flight.is_empty() {
            ctx.sys_log
                .warning(format!("{}: {} query(s) went unanswered", core.name, self.in_flight.len()));
            let in_flight = std::mem::take(&mut self.in_flight);
            for query in in_flight.values() {
                self.complete(core, ctx, query, false);
            }
        }
    }

    fn complete(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, query: &DatabaseQuery, success: bool) {
        self.last_query_success = Some(success);
        if query.requester != core.name {
            ctx.emit(SoftwareEvent::DatabaseQueryCompleted {
                requester: query.requester.clone(),
                request_id: query.request_id,
                success,
            });
        }
    }
}

impl SoftwareBehaviour for DatabaseClient {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Database(packet) = &inbound.payload else {
            return false;
        };
        match packet {
            DatabasePacket::ConnectResponse {
                connection_request_id,
                connection_id,
                status_code,
            } => {
                if self.connection_request_id != Some(*connection_request_id) {
                    return false;
                }
                self.connection_request_id = None;
                let queued: Vec<DatabaseQuery> = self.queued.drain(..).collect();
                match (*status_code, *connection_id) {
                    (HTTP_OK, Some(connection_id)) => {
                        ctx.sys_log.info(format!("{}: connected with id {}", core.name, connection_id));
                        self.connection_id = Some(connection_id);
                        for query in queued {
                            self.send_sql(ctx, inbound.src_ip_address, connection_id, query);
                        }
                    }
                    (status_code, _) => {
                        ctx.sys_log
                            .warning(format!("{}: connection refused with status {}", core.name, status_code));
                        for query in queued {
                            self.complete(core, ctx, &query, false);
                        }
                    }
                }
                true
            }
            DatabasePacket::SqlResponse { query_id, status_code, .. } => {
                let Some(query) = self.in_flight.remove(query_id) else {
                    return false;
                };
                if *status_code == HTTP_UNAUTHORIZED {
                    // the server no longer knows this connection
                    self.connection_id = None;
                }
                let success = *status_code == HTTP_OK;
                ctx.sys_log.info(format!(
                    "{}: query {} returned {}",
                    core.name, query.query, status_code
                ));
                self.complete(core, ctx, &query, success);
                true
            }
            _ => false,
        }
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        match event {
            SoftwareEvent::DatabaseQueryRequested(query) => {
                self.query(core, ctx, query.clone());
                true
            }
            _ => false,
        }
    }

    fn on_network_idle(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        self.abandon_outstanding(core, ctx);
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("connected".to_string(), Value::from(self.connection_id.is_some()));
        state.insert(
            "last_query_success".to_string(),
            self.last_query_success.map_or(Value::Null, Value::from),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::IpProtocol;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 14);

    fn reply(packet: DatabasePacket) -> InboundPayload {
        InboundPayload {
            payload: Payload::Database(packet),
            src_ip_address: SERVER,
            src_port: POSTGRES_PORT,
            dst_port: POSTGRES_PORT,
            protocol: IpProtocol::Tcp,
        }
    }

    #[test]
    fn test_queued_query_is_sent_after_connect() {
        let mut client = DatabaseClient {
            server_ip_address: Some(SERVER),
            ..DatabaseClient::default()
        };
        let mut core = SoftwareCore::new("database-client", Some(POSTGRES_PORT), IpProtocol::Tcp, 2);
        let mut ctx = NodeContext::new("web_server", &SimConfig::default());

        let query = DatabaseQuery {
            requester: "web-server".to_string(),
            request_id: 42,
            query: "SELECT".to_string(),
            server_ip_address: None,
            server_password: None,
        };
        assert!(client.on_event(&mut core, &mut ctx, &SoftwareEvent::DatabaseQueryRequested(query)));
        let sent = ctx.take_outbound();
        let Payload::Database(DatabasePacket::ConnectRequest { connection_request_id, .. }) = sent[0].payload else {
            panic!("expected a connect request");
        };

        client.receive(
            &mut core,
            &mut ctx,
            &reply(DatabasePacket::ConnectResponse {
                connection_request_id,
                connection_id: Some(9),
                status_code: HTTP_OK,
            }),
        );
        assert!(client.is_connected());
        let sent = ctx.take_outbound();
        let Payload::Database(DatabasePacket::Sql { query_id, connection_id: 9, .. }) = sent[0].payload else {
            panic!("expected the queued query");
        };

        client.receive(
            &mut core,
            &mut ctx,
            &reply(DatabasePacket::SqlResponse {
                query_id,
                status_code: HTTP_OK,
                data: true,
            }),
        );
        assert_eq!(
            ctx.pop_event(),
            Some(SoftwareEvent::DatabaseQueryCompleted {
                requester: "web-server".to_string(),
                request_id: 42,
                success: true,
            })
        );
    }

    #[test]
    fn test_refused_connection_fails_queued_queries() {
        let mut client = DatabaseClient {
            server_ip_address: Some(SERVER),
            ..DatabaseClient::default()
        };
        let mut core = SoftwareCore::new("database-client", Some(POSTGRES_PORT), IpProtocol::Tcp, 2);
        let mut ctx = NodeContext::new("client_1", &SimConfig::default());

        assert_eq!(client.execute(&core, &mut ctx), ExecuteOutcome::Pending);
        let sent = ctx.take_outbound();
        let Payload::Database(DatabasePacket::ConnectRequest { connection_request_id, .. }) = sent[0].payload else {
            panic!("expected a connect request");
        };
        client.receive(
            &mut core,
            &mut ctx,
            &reply(DatabasePacket::ConnectResponse {
                connection_request_id,
                connection_id: None,
                status_code: HTTP_UNAUTHORIZED,
            }),
        );
        assert!(!client.last_query_succeeded());
        assert!(!client.is_connected());
    }

    #[test]
    fn test_lost_connect_request_fails_queries_and_next_query_reconnects() {
        let mut client = DatabaseClient {
            server_ip_address: Some(SERVER),
            ..DatabaseClient::default()
        };
        let mut core = SoftwareCore::new("database-client", Some(POSTGRES_PORT), IpProtocol::Tcp, 2);
        let mut ctx = NodeContext::new("web_server", &SimConfig::default());
        let query = |request_id| DatabaseQuery {
            requester: "web-server".to_string(),
            request_id,
            query: "SELECT".to_string(),
            server_ip_address: None,
            server_password: None,
        };

        client.on_event(&mut core, &mut ctx, &SoftwareEvent::DatabaseQueryRequested(query(1)));
        assert_eq!(ctx.take_outbound().len(), 1);
        // a second query while connecting waits for the same connect request
        client.on_event(&mut core, &mut ctx, &SoftwareEvent::DatabaseQueryRequested(query(2)));
        assert!(ctx.take_outbound().is_empty());

        client.on_network_idle(&mut core, &mut ctx);
        for request_id in [1, 2] {
            assert_eq!(
                ctx.pop_event(),
                Some(SoftwareEvent::DatabaseQueryCompleted {
                    requester: "web-server".to_string(),
                    request_id,
                    success: false,
                })
            );
        }

        client.on_event(&mut core, &mut ctx, &SoftwareEvent::DatabaseQueryRequested(query(3)));
        let sent = ctx.take_outbound();
        assert!(matches!(sent[0].payload, Payload::Database(DatabasePacket::ConnectRequest { .. })));
    }

    #[test]
    fn test_lost_sql_reply_fails_the_query() {
        let mut client = DatabaseClient {
            server_ip_address: Some(SERVER),
            connection_id: Some(9),
            ..DatabaseClient::default()
        };
        let mut core = SoftwareCore::new("database-client", Some(POSTGRES_PORT), IpProtocol::Tcp, 2);
        let mut ctx = NodeContext::new("client_1", &SimConfig::default());

        assert_eq!(client.execute(&core, &mut ctx), ExecuteOutcome::Pending);
        let sent = ctx.take_outbound();
        assert!(matches!(sent[0].payload, Payload::Database(DatabasePacket::Sql { connection_id: 9, .. })));

        client.on_network_idle(&mut core, &mut ctx);
        assert_eq!(client.last_query_success, Some(false));
        // nothing left to expire on the next quiet network
        client.on_network_idle(&mut core, &mut ctx);
        assert_eq!(ctx.pop_event(), None);
    }
}
