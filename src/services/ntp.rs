//! Time synchronisation
//!
//! The client asks its server for the time every timestep over UDP; the
//! server answers with the current simulation timestep.

use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::frame::NTP_PORT;
use crate::protocols::{NtpPacket, Payload};
use crate::software::{InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareOptions};

#[derive(Debug, Clone, Default)]
pub struct NtpClient {
    pub ntp_server: Option<Ipv4Addr>,
    time: Option<u64>,
}

impl NtpClient {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            ntp_server: options.ip("ntp_server_ip")?,
            time: None,
        })
    }

    /// Last time reported by the server
    pub fn time(&self) -> Option<u64> {
        self.time
    }
}

impl SoftwareBehaviour for NtpClient {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Ntp(NtpPacket::Reply { timestep }) = inbound.payload else {
            return false;
        };
        ctx.sys_log.debug(format!("{}: time is {}", core.name, timestep));
        self.time = Some(timestep);
        true
    }

    fn apply_timestep(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        let (Some(server), Some(client_ip)) = (self.ntp_server, ctx.ip_addresses.first().copied()) else {
            return;
        };
        ctx.sys_log.debug(format!("{}: requesting time from {}", core.name, server));
        ctx.send(OutboundPayload::udp(
            Payload::Ntp(NtpPacket::Request { client_ip }),
            server,
            NTP_PORT,
        ));
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("time".to_string(), self.time.map_or(Value::Null, Value::from));
    }
}

#[derive(Debug, Clone, Default)]
pub struct NtpServer;

impl SoftwareBehaviour for NtpServer {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Ntp(NtpPacket::Request { client_ip }) = inbound.payload else {
            return false;
        };
        ctx.sys_log.debug(format!("{}: time request from {}", core.name, client_ip));
        let timestep = ctx.timestep;
        ctx.send(OutboundPayload::reply_to(inbound, Payload::Ntp(NtpPacket::Reply { timestep })));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::IpProtocol;

    #[test]
    fn test_client_polls_each_step_and_keeps_reply() {
        let mut ctx = NodeContext::new("client_1", &SimConfig::default());
        ctx.ip_addresses.push(Ipv4Addr::new(192, 168, 10, 21));
        let mut core = SoftwareCore::new("ntp-client", Some(NTP_PORT), IpProtocol::Udp, 2);
        let mut client = NtpClient {
            ntp_server: Some(Ipv4Addr::new(192, 168, 1, 10)),
            time: None,
        };
        client.apply_timestep(&mut core, &mut ctx);
        let sent = ctx.take_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].protocol, IpProtocol::Udp);

        let reply = InboundPayload {
            payload: Payload::Ntp(NtpPacket::Reply { timestep: 7 }),
            src_ip_address: Ipv4Addr::new(192, 168, 1, 10),
            src_port: NTP_PORT,
            dst_port: NTP_PORT,
            protocol: IpProtocol::Udp,
        };
        assert!(client.receive(&mut core, &mut ctx, &reply));
        assert_eq!(client.time(), Some(7));
    }
}
