//! Per-node system log
//!
//! Every node keeps a bounded in-memory log so tests and observers can see
//! what happened on a host. Each entry is also forwarded to the `log` facade
//! under the `sys_log` target with the hostname prefixed.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SysLogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl SysLogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            SysLogLevel::Debug => log::Level::Debug,
            SysLogLevel::Info => log::Level::Info,
            SysLogLevel::Warning => log::Level::Warn,
            SysLogLevel::Error | SysLogLevel::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for SysLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysLogLevel::Debug => write!(f, "DEBUG"),
            SysLogLevel::Info => write!(f, "INFO"),
            SysLogLevel::Warning => write!(f, "WARNING"),
            SysLogLevel::Error => write!(f, "ERROR"),
            SysLogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SysLogEntry {
    pub timestep: u64,
    pub level: SysLogLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SysLog {
    hostname: String,
    capacity: usize,
    timestep: u64,
    entries: VecDeque<SysLogEntry>,
}

impl SysLog {
    pub fn new(hostname: &str, capacity: usize) -> Self {
        Self {
            hostname: hostname.to_string(),
            capacity,
            timestep: 0,
            entries: VecDeque::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn set_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
    }

    pub fn add(&mut self, level: SysLogLevel, message: impl Into<String>) {
        let message = message.into();
        log::log!(target: "sys_log", level.as_log_level(), "[{}] {}", self.hostname, message);

        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SysLogEntry {
            timestep: self.timestep,
            level,
            message,
        });
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.add(SysLogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.add(SysLogLevel::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.add(SysLogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.add(SysLogLevel::Error, message);
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.add(SysLogLevel::Critical, message);
    }

    pub fn entries(&self) -> impl Iterator<Item = &SysLogEntry> {
        self.entries.iter()
    }

    /// True if any retained entry contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|entry| entry.message.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
