//! Application-layer payloads carried inside frames

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::file_system::FileSystemItemHealthStatus;
use crate::frame::{IpProtocol, Port};
use crate::request::{Request, RequestResponse};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    None,
    Dns(DnsPacket),
    Http(HttpPacket),
    Database(DatabasePacket),
    Ftp(FtpPacket),
    Ntp(NtpPacket),
    /// Command and control traffic hidden behind another protocol's port
    C2(C2Packet),
    /// Free text, used by tests and scripted traffic
    Raw(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::None => "none",
            Payload::Dns(_) => "dns",
            Payload::Http(_) => "http",
            Payload::Database(_) => "database",
            Payload::Ftp(_) => "ftp",
            Payload::Ntp(_) => "ntp",
            Payload::C2(_) => "c2",
            Payload::Raw(_) => "raw",
        }
    }

    /// Simulated size on the wire. File transfers count the file itself.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Payload::None => 0,
            Payload::Ftp(packet) if packet.carries_file() => packet.file_size,
            Payload::Raw(text) => text.len() as u64,
            other => serde_json::to_string(other).map_or(0, |text| text.len() as u64),
        }
    }

    /// True if the serialised payload mentions `keyword`
    pub fn contains_keyword(&self, keyword: &str) -> bool {
        match self {
            Payload::None => false,
            Payload::Raw(text) => text.contains(keyword),
            other => serde_json::to_string(other).map_or(false, |text| text.contains(keyword)),
        }
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsPacket {
    Query {
        domain_name: String,
    },
    Reply {
        domain_name: String,
        /// None when the server has no record
        ip_address: Option<Ipv4Addr>,
    },
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

pub const HTTP_OK: u16 = 200;
pub const HTTP_UNAUTHORIZED: u16 = 401;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpPacket {
    Request {
        method: HttpMethod,
        url: String,
        request_id: u64,
    },
    Response {
        status_code: u16,
        request_id: u64,
    },
}

/// Split a URL such as `http://arcd.com/users/` into host and path
pub fn split_url(url: &str) -> (String, String) {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    match without_scheme.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{}", path)),
        None => (without_scheme.to_string(), "/".to_string()),
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabasePacket {
    ConnectRequest {
        connection_request_id: u64,
        password: Option<String>,
    },
    ConnectResponse {
        connection_request_id: u64,
        connection_id: Option<u64>,
        status_code: u16,
    },
    Sql {
        query: String,
        query_id: u64,
        connection_id: u64,
    },
    SqlResponse {
        query_id: u64,
        status_code: u16,
        /// Whether the query returned usable data
        data: bool,
    },
    Disconnect {
        connection_id: u64,
    },
}

// ============================================================================
// FTP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FtpCommand {
    /// Store the carried file on the receiver
    Stor,
    /// Ask the receiver to send a file back
    Retr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FtpPacket {
    pub command: FtpCommand,
    pub transfer_id: u64,
    pub src_folder_name: String,
    pub src_file_name: String,
    pub dest_folder_name: String,
    pub dest_file_name: String,
    pub file_size: u64,
    pub health_status: Option<FileSystemItemHealthStatus>,
    /// Set on replies
    pub status_code: Option<u16>,
}

impl FtpPacket {
    /// Stor requests and Retr replies carry the file itself
    pub fn carries_file(&self) -> bool {
        self.health_status.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.status_code.is_some()
    }
}

// ============================================================================
// NTP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NtpPacket {
    Request { client_ip: Ipv4Addr },
    Reply { timestep: u64 },
}

// ============================================================================
// C2
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum C2Packet {
    /// Beacon check-in; the server answers on the same port and protocol
    KeepAlive {
        masquerade_protocol: IpProtocol,
        masquerade_port: Port,
        keep_alive_frequency: u32,
    },
    /// A request for the beacon to apply to its own node
    Input { command_id: u64, request: Request },
    Output {
        command_id: u64,
        response: RequestResponse,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_match_reads_serialised_payload() {
        let attack = Payload::Database(DatabasePacket::Sql {
            query: "DELETE".to_string(),
            query_id: 1,
            connection_id: 7,
        });
        assert!(attack.contains_keyword("DELETE"));
        assert!(!attack.contains_keyword("ENCRYPT"));
        assert!(!Payload::None.contains_keyword("DELETE"));
    }

    #[test]
    fn test_split_url() {
        assert_eq!(split_url("http://arcd.com/users/"), ("arcd.com".to_string(), "/users/".to_string()));
        assert_eq!(split_url("http://192.168.1.12"), ("192.168.1.12".to_string(), "/".to_string()));
        assert_eq!(split_url("arcd.com/"), ("arcd.com".to_string(), "/".to_string()));
    }

    #[test]
    fn test_file_transfer_size_counts_file() {
        let packet = FtpPacket {
            command: FtpCommand::Stor,
            transfer_id: 1,
            src_folder_name: "database".to_string(),
            src_file_name: "database.db".to_string(),
            dest_folder_name: "backups".to_string(),
            dest_file_name: "database.db".to_string(),
            file_size: 4_000,
            health_status: Some(FileSystemItemHealthStatus::Good),
            status_code: None,
        };
        assert_eq!(Payload::Ftp(packet.clone()).size_bytes(), 4_000);

        let request = FtpPacket {
            command: FtpCommand::Retr,
            health_status: None,
            ..packet
        };
        assert!(Payload::Ftp(request).size_bytes() < 4_000);
    }
}
