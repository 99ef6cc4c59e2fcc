//! File transfer
//!
//! The client serves `FtpTransferRequested` events from other software on
//! the node: STOR pushes a local file to a server, RETR pulls one back. Each
//! transfer ends with a `FileTransferCompleted` event for the requester.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::file_system::FileSystemItemHealthStatus;
use crate::frame::FTP_PORT;
use crate::protocols::{FtpCommand, FtpPacket, Payload, HTTP_INTERNAL_SERVER_ERROR, HTTP_NOT_FOUND, HTTP_OK};
use crate::software::{FtpTransfer, InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent};

/// Write a received file, replacing any live file of the same name
pub(crate) fn store_file(
    ctx: &mut NodeContext,
    folder_name: &str,
    file_name: &str,
    size: u64,
    health_status: FileSystemItemHealthStatus,
) -> bool {
    if let Some(folder) = ctx.file_system.get_folder_mut(folder_name) {
        folder.take_file(file_name);
    }
    match ctx
        .file_system
        .create_file(&mut ctx.sys_log, folder_name, file_name, Some(size))
    {
        Some(file) => {
            file.health_status = health_status;
            true
        }
        None => false,
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FtpClient {
    in_flight: BTreeMap<u64, FtpTransfer>,
    last_transfer_id: Option<u64>,
    last_transfer_status: Option<bool>,
}

impl FtpClient {
    pub fn last_transfer_succeeded(&self) -> bool {
        self.last_transfer_status == Some(true)
    }

    pub fn transfers_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Send the opening packet of a transfer; None if the source file is missing
    pub fn start_transfer(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, transfer: FtpTransfer) -> Option<u64> {
        let (file_size, health_status) = match transfer.command {
            FtpCommand::Stor => {
                let Some(file) = ctx
                    .file_system
                    .get_file(&transfer.src_folder_name, &transfer.src_file_name)
                else {
                    ctx.sys_log.error(format!(
                        "{}: Unable to send file {}/{}, it does not exist",
                        core.name, transfer.src_folder_name, transfer.src_file_name
                    ));
                    self.finish(ctx, &transfer, false);
                    return None;
                };
                (file.size, Some(file.health_status))
            }
            FtpCommand::Retr => (0, None),
        };

        let transfer_id = ctx.next_id();
        ctx.sys_log.info(format!(
            "{}: {:?} {}/{} with {}",
            core.name, transfer.command, transfer.src_folder_name, transfer.src_file_name, transfer.dest_ip_address
        ));
        ctx.send(OutboundPayload::tcp(
            Payload::Ftp(FtpPacket {
                command: transfer.command,
                transfer_id,
                src_folder_name: transfer.src_folder_name.clone(),
                src_file_name: transfer.src_file_name.clone(),
                dest_folder_name: transfer.dest_folder_name.clone(),
                dest_file_name: transfer.dest_file_name.clone(),
                file_size,
                health_status,
                status_code: None,
            }),
            transfer.dest_ip_address,
            FTP_PORT,
        ));
        self.last_transfer_id = Some(transfer_id);
        self.last_transfer_status = None;
        self.in_flight.insert(transfer_id, transfer);
        Some(transfer_id)
    }

    fn finish(&mut self, ctx: &mut NodeContext, transfer: &FtpTransfer, success: bool) {
        ctx.emit(SoftwareEvent::FileTransferCompleted {
            requester: transfer.requester.clone(),
            command: transfer.command,
            folder_name: transfer.dest_folder_name.clone(),
            file_name: transfer.dest_file_name.clone(),
            success,
        });
    }
}

impl SoftwareBehaviour for FtpClient {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Ftp(packet) = &inbound.payload else {
            return false;
        };
        if !packet.is_reply() {
            return false;
        }
        let Some(transfer) = self.in_flight.remove(&packet.transfer_id) else {
            ctx.sys_log.debug(format!("{}: reply for unknown transfer {}", core.name, packet.transfer_id));
            return false;
        };
        let mut success = packet.status_code == Some(HTTP_OK);
        if success && transfer.command == FtpCommand::Retr {
            success = match packet.health_status {
                Some(health_status) => store_file(
                    ctx,
                    &transfer.dest_folder_name,
                    &transfer.dest_file_name,
                    packet.file_size,
                    health_status,
                ),
                None => false,
            };
        }
        if success {
            ctx.sys_log.info(format!("{}: transfer {} complete", core.name, packet.transfer_id));
        } else {
            ctx.sys_log.error(format!("{}: transfer {} failed", core.name, packet.transfer_id));
        }
        if self.last_transfer_id == Some(packet.transfer_id) {
            self.last_transfer_status = Some(success);
        }
        self.finish(ctx, &transfer, success);
        true
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        match event {
            SoftwareEvent::FtpTransferRequested(transfer) => {
                self.start_transfer(core, ctx, transfer.clone());
                true
            }
            _ => false,
        }
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("transfers_in_flight".to_string(), Value::from(self.in_flight.len()));
    }
}

// ============================================================================
// SERVER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FtpServer {
    files_received: u64,
}

impl SoftwareBehaviour for FtpServer {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Ftp(packet) = &inbound.payload else {
            return false;
        };
        if packet.is_reply() {
            return false;
        }
        let mut reply = packet.clone();
        match packet.command {
            FtpCommand::Stor => {
                let stored = packet.health_status.map_or(false, |health_status| {
                    store_file(
                        ctx,
                        &packet.dest_folder_name,
                        &packet.dest_file_name,
                        packet.file_size,
                        health_status,
                    )
                });
                if stored {
                    self.files_received += 1;
                    ctx.sys_log.info(format!(
                        "{}: stored {}/{} from {}",
                        core.name, packet.dest_folder_name, packet.dest_file_name, inbound.src_ip_address
                    ));
                }
                reply.health_status = None;
                reply.file_size = 0;
                reply.status_code = Some(if stored { HTTP_OK } else { HTTP_INTERNAL_SERVER_ERROR });
            }
            FtpCommand::Retr => match ctx.file_system.get_file(&packet.src_folder_name, &packet.src_file_name) {
                Some(file) => {
                    reply.file_size = file.size;
                    reply.health_status = Some(file.health_status);
                    reply.status_code = Some(HTTP_OK);
                }
                None => {
                    ctx.sys_log.warning(format!(
                        "{}: {}/{} requested by {} does not exist",
                        core.name, packet.src_folder_name, packet.src_file_name, inbound.src_ip_address
                    ));
                    reply.status_code = Some(HTTP_NOT_FOUND);
                }
            },
        }
        ctx.send(OutboundPayload::reply_to(inbound, Payload::Ftp(reply)));
        true
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("files_received".to_string(), Value::from(self.files_received));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::IpProtocol;
    use std::net::Ipv4Addr;

    fn context(hostname: &str) -> NodeContext {
        let mut ctx = NodeContext::new(hostname, &SimConfig::default());
        ctx.operational = true;
        ctx
    }

    fn as_inbound(outbound: OutboundPayload, src_ip_address: Ipv4Addr) -> InboundPayload {
        InboundPayload {
            payload: outbound.payload,
            src_ip_address,
            src_port: outbound.src_port,
            dst_port: outbound.dst_port,
            protocol: outbound.protocol,
        }
    }

    #[test]
    fn test_store_then_retrieve_keeps_health() {
        let client_ip = Ipv4Addr::new(192, 168, 1, 14);
        let server_ip = Ipv4Addr::new(192, 168, 1, 16);
        let mut client_ctx = context("database_server");
        let mut server_ctx = context("backup_server");
        let mut client = FtpClient::default();
        let mut server = FtpServer::default();
        let mut client_core = SoftwareCore::new("ftp-client", Some(FTP_PORT), IpProtocol::Tcp, 2);
        let mut server_core = SoftwareCore::new("ftp-server", Some(FTP_PORT), IpProtocol::Tcp, 2);

        client_ctx
            .file_system
            .create_file(&mut client_ctx.sys_log, "database", "database.db", Some(1_000));
        let stor = FtpTransfer {
            requester: "database-service".to_string(),
            command: FtpCommand::Stor,
            dest_ip_address: server_ip,
            src_folder_name: "database".to_string(),
            src_file_name: "database.db".to_string(),
            dest_folder_name: "backups".to_string(),
            dest_file_name: "database.db".to_string(),
        };
        assert!(client.start_transfer(&client_core, &mut client_ctx, stor).is_some());

        for outbound in client_ctx.take_outbound() {
            server.receive(&mut server_core, &mut server_ctx, &as_inbound(outbound, client_ip));
        }
        assert_eq!(server_ctx.file_system.get_file("backups", "database.db").map(|file| file.size), Some(1_000));
        for outbound in server_ctx.take_outbound() {
            client.receive(&mut client_core, &mut client_ctx, &as_inbound(outbound, server_ip));
        }
        assert!(client.last_transfer_succeeded());

        // damage the backup, then pull it back
        if let Some(file) = server_ctx.file_system.get_file_mut("backups", "database.db") {
            file.health_status = FileSystemItemHealthStatus::Corrupt;
        }
        let retr = FtpTransfer {
            requester: "database-service".to_string(),
            command: FtpCommand::Retr,
            dest_ip_address: server_ip,
            src_folder_name: "backups".to_string(),
            src_file_name: "database.db".to_string(),
            dest_folder_name: "downloads".to_string(),
            dest_file_name: "database.db".to_string(),
        };
        client.start_transfer(&client_core, &mut client_ctx, retr);
        for outbound in client_ctx.take_outbound() {
            server.receive(&mut server_core, &mut server_ctx, &as_inbound(outbound, client_ip));
        }
        for outbound in server_ctx.take_outbound() {
            client.receive(&mut client_core, &mut client_ctx, &as_inbound(outbound, server_ip));
        }
        let downloaded = client_ctx.file_system.get_file("downloads", "database.db").expect("downloaded");
        assert_eq!(downloaded.health_status, FileSystemItemHealthStatus::Corrupt);
        assert_eq!(client.transfers_in_flight(), 0);
    }

    #[test]
    fn test_missing_source_fails_transfer_at_once() {
        let mut ctx = context("database_server");
        let mut client = FtpClient::default();
        let core = SoftwareCore::new("ftp-client", Some(FTP_PORT), IpProtocol::Tcp, 2);
        let transfer = FtpTransfer {
            requester: "database-service".to_string(),
            command: FtpCommand::Stor,
            dest_ip_address: Ipv4Addr::new(192, 168, 1, 16),
            src_folder_name: "database".to_string(),
            src_file_name: "missing.db".to_string(),
            dest_folder_name: "backups".to_string(),
            dest_file_name: "missing.db".to_string(),
        };
        assert!(client.start_transfer(&core, &mut ctx, transfer).is_none());
        assert!(matches!(
            ctx.pop_event(),
            Some(SoftwareEvent::FileTransferCompleted { success: false, .. })
        ));
    }
}
