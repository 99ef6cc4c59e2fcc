//! SQL database service
//!
//! Backed by a single file, `database/database.db`, whose health decides what
//! queries return. Clients connect with a password and then send queries on
//! the connection. At timestep 1 the service backs its file up to the
//! configured backup server over FTP; when a fix completes it restores from
//! that backup.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::file_system::FileSystemItemHealthStatus;
use crate::protocols::{
    DatabasePacket, FtpCommand, Payload, HTTP_INTERNAL_SERVER_ERROR, HTTP_NOT_FOUND, HTTP_OK, HTTP_SERVICE_UNAVAILABLE,
    HTTP_UNAUTHORIZED,
};
use crate::software::{
    FtpTransfer, InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent,
    SoftwareHealthState, SoftwareOptions,
};

pub const DATABASE_FOLDER: &str = "database";
pub const DATABASE_FILE: &str = "database.db";
const DOWNLOADS_FOLDER: &str = "downloads";

/// Folder on the backup server that holds this host's backup
pub fn backup_folder_name(hostname: &str) -> String {
    format!("{}_backup", hostname)
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseService {
    pub password: Option<String>,
    pub backup_server_ip: Option<Ipv4Addr>,
    /// connection id -> client address
    connections: BTreeMap<u64, Ipv4Addr>,
    backup_status: Option<bool>,
    restore_in_flight: bool,
    restore_status: Option<bool>,
}

impl DatabaseService {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            password: options.string("db_password")?,
            backup_server_ip: options.ip("backup_server_ip")?,
            ..Self::default()
        })
    }

    pub fn configure_backup(&mut self, backup_server_ip: Ipv4Addr) {
        self.backup_server_ip = Some(backup_server_ip);
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn last_backup_succeeded(&self) -> bool {
        self.backup_status == Some(true)
    }

    pub fn last_restore_succeeded(&self) -> bool {
        self.restore_status == Some(true)
    }

    /// Ask the FTP client to copy the database file to the backup server
    pub fn backup_database(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> bool {
        let Some(backup_server_ip) = self.backup_server_ip else {
            ctx.sys_log.warning(format!("{} - {}: not configured.", core.name, ctx.hostname));
            return false;
        };
        if ctx.file_system.get_file(DATABASE_FOLDER, DATABASE_FILE).is_none() {
            ctx.sys_log
                .error(format!("{}: Attempted to backup database file but it doesn't exist.", core.name));
            return false;
        }
        self.backup_status = None;
        let dest_folder_name = backup_folder_name(&ctx.hostname);
        ctx.emit(SoftwareEvent::FtpTransferRequested(FtpTransfer {
            requester: core.name.clone(),
            command: FtpCommand::Stor,
            dest_ip_address: backup_server_ip,
            src_folder_name: DATABASE_FOLDER.to_string(),
            src_file_name: DATABASE_FILE.to_string(),
            dest_folder_name,
            dest_file_name: DATABASE_FILE.to_string(),
        }));
        true
    }

    /// Fetch the backup into `downloads`; the database file is replaced when it lands
    pub fn restore_backup(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> bool {
        let Some(backup_server_ip) = self.backup_server_ip else {
            ctx.sys_log.error("Unable to restore database backup.");
            return false;
        };
        self.restore_in_flight = true;
        self.restore_status = None;
        let src_folder_name = backup_folder_name(&ctx.hostname);
        ctx.emit(SoftwareEvent::FtpTransferRequested(FtpTransfer {
            requester: core.name.clone(),
            command: FtpCommand::Retr,
            dest_ip_address: backup_server_ip,
            src_folder_name,
            src_file_name: DATABASE_FILE.to_string(),
            dest_folder_name: DOWNLOADS_FOLDER.to_string(),
            dest_file_name: DATABASE_FILE.to_string(),
        }));
        true
    }

    fn replace_database_file(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) -> bool {
        let existing = ctx
            .file_system
            .get_folder(DATABASE_FOLDER)
            .and_then(|folder| folder.get_file_including_deleted(DATABASE_FILE))
            .map(|file| (file.is_deleted(), file.visible_health_status));
        let Some((deleted, old_visible_status)) = existing else {
            ctx.sys_log.warning("Database file not initialised.");
            return false;
        };
        if !deleted {
            ctx.file_system.delete_file(&mut ctx.sys_log, DATABASE_FOLDER, DATABASE_FILE);
        }
        ctx.file_system
            .copy_file(&mut ctx.sys_log, DOWNLOADS_FOLDER, DATABASE_FILE, DATABASE_FOLDER);
        let Some(db_file) = ctx.file_system.get_file_mut(DATABASE_FOLDER, DATABASE_FILE) else {
            ctx.sys_log.error("Copying database backup failed.");
            return false;
        };
        db_file.visible_health_status = old_visible_status;
        core.set_health_state(SoftwareHealthState::Good);
        ctx.sys_log.info(format!("{}: database restored from backup", core.name));
        true
    }

    fn process_connect(
        &mut self,
        core: &SoftwareCore,
        ctx: &mut NodeContext,
        src_ip_address: Ipv4Addr,
        password: &Option<String>,
    ) -> (u16, Option<u64>) {
        match core.health_state_actual {
            SoftwareHealthState::Good | SoftwareHealthState::Fixing | SoftwareHealthState::Compromised => {
                if *password == self.password {
                    let connection_id = ctx.next_id();
                    self.connections.insert(connection_id, src_ip_address);
                    ctx.sys_log.info(format!(
                        "{}: connection {} established with {}",
                        core.name, connection_id, src_ip_address
                    ));
                    (HTTP_OK, Some(connection_id))
                } else {
                    ctx.sys_log.info(format!(
                        "{}: connection request from {} unauthorised (incorrect password)",
                        core.name, src_ip_address
                    ));
                    (HTTP_UNAUTHORIZED, None)
                }
            }
            _ => {
                ctx.sys_log.info(format!("{}: connection request from {} declined", core.name, src_ip_address));
                (HTTP_SERVICE_UNAVAILABLE, None)
            }
        }
    }

    /// Run a query against the database file; returns status code and whether data came back
    fn process_sql(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, query: &str) -> (u16, bool) {
        ctx.sys_log.info(format!("{}: Running {}", core.name, query));
        if ctx.file_system.get_file(DATABASE_FOLDER, DATABASE_FILE).is_none() {
            ctx.sys_log
                .error(format!("{}: Failed to run {} because the database file is missing.", core.name, query));
            return (HTTP_NOT_FOUND, false);
        }
        if core.health_state_actual != SoftwareHealthState::Good {
            ctx.sys_log.error(format!(
                "{}: Failed to run {} because the database service is unavailable.",
                core.name, query
            ));
            return (HTTP_INTERNAL_SERVER_ERROR, false);
        }
        let Some(db_file) = ctx.file_system.get_file_mut(DATABASE_FOLDER, DATABASE_FILE) else {
            return (HTTP_NOT_FOUND, false);
        };
        match query {
            "SELECT" => match db_file.health_status {
                FileSystemItemHealthStatus::Good => (HTTP_OK, true),
                FileSystemItemHealthStatus::Corrupt => (HTTP_OK, false),
                _ => (HTTP_NOT_FOUND, false),
            },
            "DELETE" => {
                db_file.health_status = FileSystemItemHealthStatus::Compromised;
                (HTTP_OK, false)
            }
            "ENCRYPT" => {
                db_file.health_status = FileSystemItemHealthStatus::Corrupt;
                db_file.num_access += 1;
                if let Some(folder) = ctx.file_system.get_folder_mut(DATABASE_FOLDER) {
                    folder.health_status = FileSystemItemHealthStatus::Corrupt;
                }
                (HTTP_OK, false)
            }
            "INSERT" | "SELECT * FROM pg_stat_activity" => (HTTP_OK, false),
            other => {
                ctx.sys_log.warning(format!("{}: Invalid {}", core.name, other));
                (HTTP_INTERNAL_SERVER_ERROR, false)
            }
        }
    }
}

impl SoftwareBehaviour for DatabaseService {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Database(packet) = &inbound.payload else {
            ctx.sys_log
                .info(format!("{}: Ignoring payload as it is not a Database payload", core.name));
            return false;
        };
        let response = match packet {
            DatabasePacket::ConnectRequest {
                connection_request_id,
                password,
            } => {
                let (status_code, connection_id) =
                    self.process_connect(core, ctx, inbound.src_ip_address, password);
                DatabasePacket::ConnectResponse {
                    connection_request_id: *connection_request_id,
                    connection_id,
                    status_code,
                }
            }
            DatabasePacket::Sql {
                query,
                query_id,
                connection_id,
            } => {
                let (status_code, data) = if self.connections.contains_key(connection_id) {
                    self.process_sql(core, ctx, query)
                } else {
                    (HTTP_UNAUTHORIZED, false)
                };
                DatabasePacket::SqlResponse {
                    query_id: *query_id,
                    status_code,
                    data,
                }
            }
            DatabasePacket::Disconnect { connection_id } => {
                match self.connections.get(connection_id) {
                    Some(address) if *address == inbound.src_ip_address => {
                        ctx.sys_log
                            .info(format!("{}: Received disconnect command for {}", core.name, connection_id));
                        self.connections.remove(connection_id);
                    }
                    Some(address) => ctx.sys_log.warning(format!(
                        "{}: Ignoring disconnect for {} from {}, connection belongs to {}",
                        core.name, connection_id, inbound.src_ip_address, address
                    )),
                    None => {}
                }
                return true;
            }
            DatabasePacket::ConnectResponse { .. } | DatabasePacket::SqlResponse { .. } => return false,
        };
        ctx.send(OutboundPayload::reply_to(inbound, Payload::Database(response)));
        true
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        if let SoftwareEvent::FileTransferCompleted {
            requester,
            command,
            success,
            ..
        } = event
        {
            if *requester != core.name {
                return false;
            }
            match command {
                FtpCommand::Stor => {
                    if !*success {
                        ctx.sys_log.error("Unable to create database backup.");
                    }
                    self.backup_status = Some(*success);
                }
                FtpCommand::Retr if self.restore_in_flight => {
                    self.restore_in_flight = false;
                    let restored = *success && self.replace_database_file(core, ctx);
                    if !restored {
                        ctx.sys_log.error("Unable to restore database backup.");
                    }
                    self.restore_status = Some(restored);
                }
                FtpCommand::Retr => {}
            }
        }
        false
    }

    fn apply_timestep(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        if ctx.timestep == 1 {
            self.backup_database(core, ctx);
        }
    }

    fn on_fixed(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        self.restore_backup(core, ctx);
    }

    fn on_install(&mut self, _core: &mut SoftwareCore, ctx: &mut NodeContext) {
        if ctx.file_system.get_file(DATABASE_FOLDER, DATABASE_FILE).is_none() {
            ctx.file_system
                .create_file(&mut ctx.sys_log, DATABASE_FOLDER, DATABASE_FILE, None);
        }
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("num_connections".to_string(), Value::from(self.connections.len()));
        state.insert(
            "backup_server_ip".to_string(),
            self.backup_server_ip.map_or(Value::Null, |ip| Value::from(ip.to_string())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::{IpProtocol, POSTGRES_PORT};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 12);

    fn installed() -> (DatabaseService, SoftwareCore, NodeContext) {
        let mut db = DatabaseService {
            password: Some("secret".to_string()),
            ..DatabaseService::default()
        };
        let mut core = SoftwareCore::new("database-service", Some(POSTGRES_PORT), IpProtocol::Tcp, 2);
        core.set_health_state(SoftwareHealthState::Good);
        let mut ctx = NodeContext::new("database_server", &SimConfig::default());
        ctx.operational = true;
        db.on_install(&mut core, &mut ctx);
        (db, core, ctx)
    }

    fn inbound(packet: DatabasePacket) -> InboundPayload {
        InboundPayload {
            payload: Payload::Database(packet),
            src_ip_address: CLIENT,
            src_port: POSTGRES_PORT,
            dst_port: POSTGRES_PORT,
            protocol: IpProtocol::Tcp,
        }
    }

    fn connect(db: &mut DatabaseService, core: &mut SoftwareCore, ctx: &mut NodeContext, password: &str) -> DatabasePacket {
        db.receive(
            core,
            ctx,
            &inbound(DatabasePacket::ConnectRequest {
                connection_request_id: 1,
                password: Some(password.to_string()),
            }),
        );
        match ctx.take_outbound().pop().map(|out| out.payload) {
            Some(Payload::Database(packet)) => packet,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn sql(db: &mut DatabaseService, core: &mut SoftwareCore, ctx: &mut NodeContext, connection_id: u64, query: &str) -> (u16, bool) {
        db.receive(
            core,
            ctx,
            &inbound(DatabasePacket::Sql {
                query: query.to_string(),
                query_id: 2,
                connection_id,
            }),
        );
        match ctx.take_outbound().pop().map(|out| out.payload) {
            Some(Payload::Database(DatabasePacket::SqlResponse { status_code, data, .. })) => (status_code, data),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_wrong_password_is_unauthorised() {
        let (mut db, mut core, mut ctx) = installed();
        let reply = connect(&mut db, &mut core, &mut ctx, "guess");
        assert!(matches!(reply, DatabasePacket::ConnectResponse { status_code: 401, connection_id: None, .. }));
        assert_eq!(db.num_connections(), 0);
    }

    #[test]
    fn test_delete_compromises_file_and_breaks_select() {
        let (mut db, mut core, mut ctx) = installed();
        let DatabasePacket::ConnectResponse {
            connection_id: Some(connection_id),
            ..
        } = connect(&mut db, &mut core, &mut ctx, "secret")
        else {
            panic!("connection refused");
        };

        assert_eq!(sql(&mut db, &mut core, &mut ctx, connection_id, "SELECT"), (HTTP_OK, true));
        assert_eq!(sql(&mut db, &mut core, &mut ctx, connection_id, "DELETE"), (HTTP_OK, false));
        assert_eq!(sql(&mut db, &mut core, &mut ctx, connection_id, "SELECT"), (HTTP_NOT_FOUND, false));
        assert_eq!(sql(&mut db, &mut core, &mut ctx, connection_id + 100, "SELECT"), (HTTP_UNAUTHORIZED, false));
    }

    #[test]
    fn test_encrypt_corrupts_file_and_folder() {
        let (mut db, mut core, mut ctx) = installed();
        let DatabasePacket::ConnectResponse {
            connection_id: Some(connection_id),
            ..
        } = connect(&mut db, &mut core, &mut ctx, "secret")
        else {
            panic!("connection refused");
        };
        sql(&mut db, &mut core, &mut ctx, connection_id, "ENCRYPT");
        let file = ctx.file_system.get_file(DATABASE_FOLDER, DATABASE_FILE).expect("db file");
        assert_eq!(file.health_status, FileSystemItemHealthStatus::Corrupt);
        assert_eq!(
            ctx.file_system.get_folder(DATABASE_FOLDER).map(|folder| folder.health_status),
            Some(FileSystemItemHealthStatus::Corrupt)
        );
        // corrupt data still answers a SELECT, just without data
        assert_eq!(sql(&mut db, &mut core, &mut ctx, connection_id, "SELECT"), (HTTP_OK, false));
    }

    #[test]
    fn test_backup_needs_a_server() {
        let (mut db, core, mut ctx) = installed();
        assert!(!db.backup_database(&core, &mut ctx));

        db.configure_backup(Ipv4Addr::new(192, 168, 1, 16));
        assert!(db.backup_database(&core, &mut ctx));
        let Some(SoftwareEvent::FtpTransferRequested(transfer)) = ctx.pop_event() else {
            panic!("expected a transfer request");
        };
        assert_eq!(transfer.dest_folder_name, "database_server_backup");
        assert_eq!(transfer.command, FtpCommand::Stor);
    }
}
