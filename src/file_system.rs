//! Simulated file system
//!
//! A node's file system is a flat set of named folders holding named files.
//! Every item carries an actual health status and a visible one; the visible
//! status only changes when the item is scanned. Deleting an item moves it to
//! a parallel "deleted" collection where it ignores everything except restore.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::FileSystemTimings;
use crate::error::RequestError;
use crate::request::{
    arg_str, expect_args, options, token_to_string, RequestContext, RequestHandler, RequestManager,
    RequestResponse, RequestToken, RequestType, Validator,
};
use crate::sys_log::SysLog;
use crate::tick_countdown;

// ============================================================================
// HEALTH AND FILE TYPES
// ============================================================================

/// Health of a folder or file, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileSystemItemHealthStatus {
    None,
    Good,
    Compromised,
    Corrupt,
    Restoring,
    Destroyed,
}

impl FileSystemItemHealthStatus {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FileSystemItemHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemItemHealthStatus::None => write!(f, "NONE"),
            FileSystemItemHealthStatus::Good => write!(f, "GOOD"),
            FileSystemItemHealthStatus::Compromised => write!(f, "COMPROMISED"),
            FileSystemItemHealthStatus::Corrupt => write!(f, "CORRUPT"),
            FileSystemItemHealthStatus::Restoring => write!(f, "RESTORING"),
            FileSystemItemHealthStatus::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Unknown,
    Txt,
    Csv,
    Json,
    Docx,
    Pdf,
    Png,
    Jpeg,
    Zip,
    Exe,
    Db,
}

impl FileType {
    /// Infer the type from a file name's extension
    pub fn from_file_name(file_name: &str) -> Self {
        let extension = match file_name.rsplit_once('.') {
            Some((_, extension)) => extension.to_ascii_lowercase(),
            None => return FileType::Unknown,
        };
        match extension.as_str() {
            "txt" => FileType::Txt,
            "csv" => FileType::Csv,
            "json" => FileType::Json,
            "doc" | "docx" => FileType::Docx,
            "pdf" => FileType::Pdf,
            "png" => FileType::Png,
            "jpg" | "jpeg" => FileType::Jpeg,
            "zip" => FileType::Zip,
            "exe" => FileType::Exe,
            "db" => FileType::Db,
            _ => FileType::Unknown,
        }
    }

    /// Size in bytes given to a file created without an explicit size
    pub fn default_size(self) -> u64 {
        match self {
            FileType::Unknown => 0,
            FileType::Txt | FileType::Csv | FileType::Json => 2_048,
            FileType::Docx | FileType::Pdf => 100_000,
            FileType::Png | FileType::Jpeg => 250_000,
            FileType::Zip => 500_000,
            FileType::Exe => 2_000_000,
            FileType::Db => 1_000_000,
        }
    }
}

// ============================================================================
// FILE
// ============================================================================

#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub folder_name: String,
    pub file_type: FileType,
    /// Size on disk in bytes
    pub size: u64,
    pub health_status: FileSystemItemHealthStatus,
    pub visible_health_status: FileSystemItemHealthStatus,
    pub revealed_to_red: bool,
    pub num_access: u32,
    deleted: bool,
    restore_duration: u32,
    restore_countdown: Option<u32>,
    request_manager: RequestManager<File, SysLog>,
}

impl File {
    pub fn new(name: &str, folder_name: &str, size: Option<u64>, restore_duration: u32) -> Self {
        let file_type = FileType::from_file_name(name);
        Self {
            name: name.to_string(),
            folder_name: folder_name.to_string(),
            file_type,
            size: size.unwrap_or_else(|| file_type.default_size()),
            health_status: FileSystemItemHealthStatus::Good,
            visible_health_status: FileSystemItemHealthStatus::Good,
            revealed_to_red: false,
            num_access: 0,
            deleted: false,
            restore_duration,
            restore_countdown: None,
            request_manager: file_request_manager(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.folder_name, self.name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_restoring(&self) -> bool {
        self.restore_countdown.is_some()
    }

    pub fn scan(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to scan deleted file {}", self.path()));
            return false;
        }
        self.visible_health_status = self.health_status;
        sys_log.info(format!("Scanned file {}", self.path()));
        true
    }

    pub fn reveal_to_red(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to reveal deleted file {}", self.path()));
            return false;
        }
        self.revealed_to_red = true;
        true
    }

    pub fn corrupt(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to corrupt deleted file {}", self.path()));
            return false;
        }
        self.health_status = FileSystemItemHealthStatus::Corrupt;
        sys_log.info(format!("Corrupted file {}", self.path()));
        true
    }

    pub fn repair(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to repair deleted file {}", self.path()));
            return false;
        }
        self.health_status = FileSystemItemHealthStatus::Good;
        sys_log.info(format!("Repaired file {}", self.path()));
        true
    }

    pub fn access(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to access deleted file {}", self.path()));
            return false;
        }
        self.num_access += 1;
        true
    }

    /// Start the restore countdown, un-deleting the file first if needed.
    pub fn restore(&mut self, sys_log: &mut SysLog) -> bool {
        self.deleted = false;
        if self.restore_countdown.is_some() {
            sys_log.info(format!("File restoration already in progress {}", self.path()));
            return true;
        }
        self.health_status = FileSystemItemHealthStatus::Restoring;
        self.restore_countdown = Some(self.restore_duration);
        sys_log.info(format!("Restoring file {}", self.path()));
        true
    }

    /// Restore without a countdown, used when an enclosing folder finishes restoring
    pub fn restore_now(&mut self) {
        self.deleted = false;
        self.restore_countdown = None;
        self.health_status = FileSystemItemHealthStatus::Good;
    }

    pub(crate) fn mark_deleted(&mut self) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        self.restore_countdown = None;
        true
    }

    pub fn apply_timestep(&mut self, _timestep: u64) {
        if tick_countdown(&mut self.restore_countdown) {
            self.health_status = FileSystemItemHealthStatus::Good;
        }
    }

    pub fn describe_state(&self) -> Value {
        json!({
            "name": self.name,
            "file_type": self.file_type,
            "size": self.size,
            "health_status": self.health_status.value(),
            "visible_status": self.visible_health_status.value(),
            "revealed_to_red": self.revealed_to_red,
            "deleted": self.deleted,
            "num_access": self.num_access,
        })
    }
}

impl RequestHandler<SysLog> for File {
    fn request_manager(&self) -> &RequestManager<Self, SysLog> {
        &self.request_manager
    }
}

fn file_request_manager() -> RequestManager<File, SysLog> {
    fn scan(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.scan(sys_log)))
    }
    fn reveal_to_red(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.reveal_to_red(sys_log)))
    }
    fn corrupt(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.corrupt(sys_log)))
    }
    fn repair(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.repair(sys_log)))
    }
    fn restore(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.restore(sys_log)))
    }
    fn access(file: &mut File, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(file.access(sys_log)))
    }

    RequestManager::new()
        .with("scan", RequestType::new(scan))
        .with("reveal_to_red", RequestType::new(reveal_to_red))
        .with("corrupt", RequestType::new(corrupt))
        .with("repair", RequestType::new(repair))
        .with("restore", RequestType::new(restore))
        .with("access", RequestType::new(access))
}

// ============================================================================
// FOLDER
// ============================================================================

#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    pub health_status: FileSystemItemHealthStatus,
    pub visible_health_status: FileSystemItemHealthStatus,
    pub revealed_to_red: bool,
    files: BTreeMap<String, File>,
    deleted_files: BTreeMap<String, File>,
    deleted: bool,
    timings: FileSystemTimings,
    scan_countdown: Option<u32>,
    red_scan_countdown: Option<u32>,
    restore_countdown: Option<u32>,
    scanned_this_step: bool,
    request_manager: RequestManager<Folder, SysLog>,
}

impl Folder {
    pub fn new(name: &str, timings: FileSystemTimings) -> Self {
        Self {
            name: name.to_string(),
            health_status: FileSystemItemHealthStatus::Good,
            visible_health_status: FileSystemItemHealthStatus::Good,
            revealed_to_red: false,
            files: BTreeMap::new(),
            deleted_files: BTreeMap::new(),
            deleted: false,
            timings,
            scan_countdown: None,
            red_scan_countdown: None,
            restore_countdown: None,
            scanned_this_step: false,
            request_manager: folder_request_manager(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn scanned_this_step(&self) -> bool {
        self.scanned_this_step
    }

    pub fn files(&self) -> impl Iterator<Item = &File> {
        self.files.values()
    }

    pub fn deleted_files(&self) -> impl Iterator<Item = &File> {
        self.deleted_files.values()
    }

    /// Total size in bytes of the live files
    pub fn size(&self) -> u64 {
        self.files.values().map(|file| file.size).sum()
    }

    pub fn get_file(&self, file_name: &str) -> Option<&File> {
        self.files.get(file_name)
    }

    pub fn get_file_mut(&mut self, file_name: &str) -> Option<&mut File> {
        self.files.get_mut(file_name)
    }

    pub fn get_file_including_deleted(&self, file_name: &str) -> Option<&File> {
        self.files.get(file_name).or_else(|| self.deleted_files.get(file_name))
    }

    /// Add a file; refuses a name that is already live in this folder.
    pub fn add_file(&mut self, sys_log: &mut SysLog, mut file: File) -> bool {
        if self.files.contains_key(&file.name) {
            sys_log.error(format!("File {} already exists in folder {}", file.name, self.name));
            return false;
        }
        file.folder_name = self.name.clone();
        self.files.insert(file.name.clone(), file);
        true
    }

    /// Move a live file into the deleted collection.
    pub fn remove_file(&mut self, sys_log: &mut SysLog, file_name: &str) -> bool {
        let Some(mut file) = self.files.remove(file_name) else {
            sys_log.error(format!("File {}/{} was not found", self.name, file_name));
            return false;
        };
        file.mark_deleted();
        sys_log.info(format!("Removed file {}", file.path()));
        self.deleted_files.insert(file.name.clone(), file);
        true
    }

    /// Take a live file out of the folder entirely (used when moving files)
    pub(crate) fn take_file(&mut self, file_name: &str) -> Option<File> {
        self.files.remove(file_name)
    }

    fn remove_all_files(&mut self) {
        for (name, mut file) in std::mem::take(&mut self.files) {
            file.mark_deleted();
            self.deleted_files.insert(name, file);
        }
    }

    /// Restore a live or deleted file with a countdown.
    pub fn restore_file(&mut self, sys_log: &mut SysLog, file_name: &str) -> bool {
        if let Some(file) = self.files.get_mut(file_name) {
            return file.restore(sys_log);
        }
        let Some(mut file) = self.deleted_files.remove(file_name) else {
            sys_log.error(format!("Unable to restore file {}. File does not exist.", file_name));
            return false;
        };
        file.restore(sys_log);
        self.files.insert(file.name.clone(), file);
        true
    }

    pub fn scan(&mut self, sys_log: &mut SysLog, instant_scan: bool) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to scan deleted folder {}", self.name));
            return false;
        }
        if instant_scan {
            self.complete_scan(sys_log);
            return true;
        }
        if self.scan_countdown.is_some() {
            sys_log.info(format!("Scan is already in progress {}", self.name));
        } else {
            self.scan_countdown = Some(self.timings.scan_duration);
            sys_log.info(format!("Scanning folder {}", self.name));
        }
        true
    }

    fn complete_scan(&mut self, sys_log: &mut SysLog) {
        for file in self.files.values_mut() {
            file.scan(sys_log);
        }
        // worst file health, NONE for an empty folder
        self.health_status = self
            .files
            .values()
            .map(|file| file.health_status)
            .max()
            .unwrap_or(FileSystemItemHealthStatus::None);
        self.visible_health_status = self.health_status;
        self.scanned_this_step = true;
    }

    pub fn reveal_to_red(&mut self, sys_log: &mut SysLog, instant_scan: bool) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to reveal deleted folder {}", self.name));
            return false;
        }
        if instant_scan {
            self.complete_reveal(sys_log);
            return true;
        }
        if self.red_scan_countdown.is_some() {
            sys_log.info(format!("Red Agent Scan is already in progress {}", self.name));
        } else {
            self.red_scan_countdown = Some(self.timings.red_scan_duration);
            sys_log.info(format!("Folder revealed to red agent: {}", self.name));
        }
        true
    }

    fn complete_reveal(&mut self, sys_log: &mut SysLog) {
        self.revealed_to_red = true;
        for file in self.files.values_mut() {
            file.reveal_to_red(sys_log);
        }
    }

    pub fn corrupt(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to corrupt deleted folder {}", self.name));
            return false;
        }
        for file in self.files.values_mut() {
            file.corrupt(sys_log);
        }
        self.health_status = FileSystemItemHealthStatus::Corrupt;
        sys_log.info(format!("Corrupted folder {}", self.name));
        true
    }

    pub fn repair(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to repair deleted folder {}", self.name));
            return false;
        }
        for file in self.files.values_mut() {
            file.repair(sys_log);
        }
        self.health_status = FileSystemItemHealthStatus::Good;
        sys_log.info(format!("Repaired folder {}", self.name));
        true
    }

    /// Un-delete immediately and restore the contents once the countdown ends.
    pub fn restore(&mut self, sys_log: &mut SysLog) -> bool {
        self.deleted = false;
        if self.restore_countdown.is_some() {
            sys_log.info(format!("Folder restoration already in progress {}", self.name));
            return true;
        }
        self.restore_countdown = Some(self.timings.restore_duration);
        self.health_status = FileSystemItemHealthStatus::Restoring;
        sys_log.info(format!("Restoring folder: {}", self.name));
        true
    }

    fn complete_restore(&mut self) {
        for file in self.files.values_mut() {
            file.restore_now();
        }
        for (name, mut file) in std::mem::take(&mut self.deleted_files) {
            file.restore_now();
            self.files.insert(name, file);
        }
        if matches!(
            self.health_status,
            FileSystemItemHealthStatus::Corrupt | FileSystemItemHealthStatus::Restoring
        ) {
            self.health_status = FileSystemItemHealthStatus::Good;
        }
    }

    /// Mark the folder deleted; its files move to the deleted collection.
    pub(crate) fn mark_deleted(&mut self, sys_log: &mut SysLog) -> bool {
        if self.deleted {
            sys_log.error(format!("Unable to delete an already deleted folder {}", self.name));
            return false;
        }
        self.deleted = true;
        self.scan_countdown = None;
        self.red_scan_countdown = None;
        self.restore_countdown = None;
        self.remove_all_files();
        true
    }

    pub fn pre_timestep(&mut self, _timestep: u64) {
        self.scanned_this_step = false;
    }

    pub fn apply_timestep(&mut self, sys_log: &mut SysLog, timestep: u64) {
        if tick_countdown(&mut self.scan_countdown) {
            self.complete_scan(sys_log);
        }
        if tick_countdown(&mut self.red_scan_countdown) {
            self.complete_reveal(sys_log);
        }
        if tick_countdown(&mut self.restore_countdown) {
            self.complete_restore();
        }
        for file in self.files.values_mut() {
            file.apply_timestep(timestep);
        }
    }

    pub fn describe_state(&self) -> Value {
        let files: serde_json::Map<String, Value> = self
            .files
            .iter()
            .map(|(name, file)| (name.clone(), file.describe_state()))
            .collect();
        let deleted_files: serde_json::Map<String, Value> = self
            .deleted_files
            .iter()
            .map(|(name, file)| (name.clone(), file.describe_state()))
            .collect();
        json!({
            "name": self.name,
            "health_status": self.health_status.value(),
            "visible_status": self.visible_health_status.value(),
            "revealed_to_red": self.revealed_to_red,
            "deleted": self.deleted,
            "files": files,
            "deleted_files": deleted_files,
            "scanned_this_step": self.scanned_this_step,
        })
    }
}

impl RequestHandler<SysLog> for Folder {
    fn request_manager(&self) -> &RequestManager<Self, SysLog> {
        &self.request_manager
    }
}

fn file_exists(folder: &Folder, _: &SysLog, request: &[RequestToken], _: &RequestContext) -> bool {
    request
        .first()
        .and_then(token_to_string)
        .map_or(false, |name| folder.get_file_including_deleted(&name).is_some())
}

fn file_not_deleted(folder: &Folder, _: &SysLog, request: &[RequestToken], _: &RequestContext) -> bool {
    request
        .first()
        .and_then(token_to_string)
        .map_or(false, |name| folder.get_file(&name).is_some())
}

fn folder_request_manager() -> RequestManager<Folder, SysLog> {
    fn scan(folder: &mut Folder, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let instant = options(request).get("instant_scan").and_then(Value::as_bool).unwrap_or(false);
        Ok(RequestResponse::from_bool(folder.scan(sys_log, instant)))
    }
    fn reveal_to_red(folder: &mut Folder, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let instant = options(request).get("instant_scan").and_then(Value::as_bool).unwrap_or(false);
        Ok(RequestResponse::from_bool(folder.reveal_to_red(sys_log, instant)))
    }
    fn corrupt(folder: &mut Folder, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(folder.corrupt(sys_log)))
    }
    fn repair(folder: &mut Folder, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(folder.repair(sys_log)))
    }
    fn restore(folder: &mut Folder, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(folder.restore(sys_log)))
    }
    fn delete_file(folder: &mut Folder, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "delete")?;
        let file_name = arg_str(request, 0, "delete", "file_name")?;
        Ok(RequestResponse::from_bool(folder.remove_file(sys_log, &file_name)))
    }
    fn route_file(folder: &mut Folder, sys_log: &mut SysLog, request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let file_name = arg_str(request, 0, "file", "file_name")?;
        // deleting moves the file between collections, which only the folder can do
        if request.get(1).and_then(token_to_string).as_deref() == Some("delete") {
            return Ok(RequestResponse::from_bool(folder.remove_file(sys_log, &file_name)));
        }
        match folder.files.get_mut(&file_name) {
            Some(file) => file.handle_request(sys_log, &request[1..], context),
            None => Ok(RequestResponse::failure().with_reason("Cannot perform request on a file that does not exist.")),
        }
    }
    fn descend_file(folder: &Folder, sys_log: &SysLog, request: &[RequestToken], context: &RequestContext) -> bool {
        let Some(file) = request.first().and_then(token_to_string).and_then(|name| folder.files.get(&name)) else {
            return false;
        };
        let remaining = &request[1..];
        if remaining.first().and_then(token_to_string).as_deref() == Some("delete") {
            return true;
        }
        file.check_valid(sys_log, remaining, context)
    }

    let file_validator = Validator::new(file_exists, "Cannot perform request on a file that does not exist.")
        .and(Validator::new(file_not_deleted, "Cannot perform request on a file that is deleted."));

    RequestManager::new()
        .with("scan", RequestType::new(scan))
        .with("reveal_to_red", RequestType::new(reveal_to_red))
        .with("corrupt", RequestType::new(corrupt))
        .with("repair", RequestType::new(repair))
        .with("restore", RequestType::new(restore))
        .with("delete", RequestType::new(delete_file))
        .with("file", RequestType::route(route_file, descend_file).with_validator(file_validator))
}

// ============================================================================
// FILE SYSTEM
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileSystem {
    folders: BTreeMap<String, Folder>,
    deleted_folders: BTreeMap<String, Folder>,
    timings: FileSystemTimings,
    num_file_creations: u32,
    num_file_deletions: u32,
    request_manager: RequestManager<FileSystem, SysLog>,
}

impl FileSystem {
    pub fn new(timings: FileSystemTimings) -> Self {
        let mut folders = BTreeMap::new();
        folders.insert("root".to_string(), Folder::new("root", timings));
        Self {
            folders,
            deleted_folders: BTreeMap::new(),
            timings,
            num_file_creations: 0,
            num_file_deletions: 0,
            request_manager: file_system_request_manager(),
        }
    }

    pub fn folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    pub fn deleted_folders(&self) -> impl Iterator<Item = &Folder> {
        self.deleted_folders.values()
    }

    pub fn num_file_creations(&self) -> u32 {
        self.num_file_creations
    }

    pub fn num_file_deletions(&self) -> u32 {
        self.num_file_deletions
    }

    pub fn get_folder(&self, folder_name: &str) -> Option<&Folder> {
        self.folders.get(folder_name)
    }

    pub fn get_folder_mut(&mut self, folder_name: &str) -> Option<&mut Folder> {
        self.folders.get_mut(folder_name)
    }

    pub fn get_folder_including_deleted(&self, folder_name: &str) -> Option<&Folder> {
        self.folders
            .get(folder_name)
            .or_else(|| self.deleted_folders.get(folder_name))
    }

    pub fn get_file(&self, folder_name: &str, file_name: &str) -> Option<&File> {
        self.folders.get(folder_name)?.get_file(file_name)
    }

    pub fn get_file_mut(&mut self, folder_name: &str, file_name: &str) -> Option<&mut File> {
        self.folders.get_mut(folder_name)?.get_file_mut(file_name)
    }

    /// Create a folder; `None` (with a logged error) if the name is taken.
    pub fn create_folder(&mut self, sys_log: &mut SysLog, folder_name: &str) -> Option<&mut Folder> {
        if self.folders.contains_key(folder_name) {
            sys_log.error(format!("Cannot create folder as it already exists: {}", folder_name));
            return None;
        }
        if self.deleted_folders.contains_key(folder_name) {
            // a new folder supersedes the deleted one of the same name
            self.deleted_folders.remove(folder_name);
        }
        sys_log.info(format!("Created folder /{}", folder_name));
        let timings = self.timings;
        Some(
            self.folders
                .entry(folder_name.to_string())
                .or_insert_with(|| Folder::new(folder_name, timings)),
        )
    }

    /// Create a file, creating its folder when missing.
    pub fn create_file(
        &mut self,
        sys_log: &mut SysLog,
        folder_name: &str,
        file_name: &str,
        size: Option<u64>,
    ) -> Option<&mut File> {
        if !self.folders.contains_key(folder_name) {
            self.create_folder(sys_log, folder_name)?;
        }
        let file = File::new(file_name, folder_name, size, self.timings.restore_duration);
        let folder = self.folders.get_mut(folder_name)?;
        if !folder.add_file(sys_log, file) {
            return None;
        }
        self.num_file_creations += 1;
        sys_log.info(format!("Created file /{}/{}", folder_name, file_name));
        folder.get_file_mut(file_name)
    }

    pub fn delete_folder(&mut self, sys_log: &mut SysLog, folder_name: &str) -> bool {
        if folder_name == "root" {
            sys_log.warning("Cannot delete the root folder.");
            return false;
        }
        let Some(mut folder) = self.folders.remove(folder_name) else {
            sys_log.error(format!("Cannot delete folder as it does not exist: {}", folder_name));
            return false;
        };
        let num_files = folder.files.len() as u32;
        folder.mark_deleted(sys_log);
        self.num_file_deletions += num_files;
        sys_log.info(format!("Deleted folder /{} and its contents", folder_name));
        self.deleted_folders.insert(folder_name.to_string(), folder);
        true
    }

    pub fn delete_file(&mut self, sys_log: &mut SysLog, folder_name: &str, file_name: &str) -> bool {
        let Some(folder) = self.folders.get_mut(folder_name) else {
            sys_log.error(format!("Unable to delete file /{}/{}. Folder does not exist.", folder_name, file_name));
            return false;
        };
        if folder.remove_file(sys_log, file_name) {
            self.num_file_deletions += 1;
            return true;
        }
        false
    }

    pub fn restore_folder(&mut self, sys_log: &mut SysLog, folder_name: &str) -> bool {
        if let Some(folder) = self.folders.get_mut(folder_name) {
            return folder.restore(sys_log);
        }
        let Some(mut folder) = self.deleted_folders.remove(folder_name) else {
            sys_log.error(format!("Unable to restore folder {}. Folder does not exist.", folder_name));
            return false;
        };
        folder.restore(sys_log);
        self.folders.insert(folder_name.to_string(), folder);
        true
    }

    pub fn restore_file(&mut self, sys_log: &mut SysLog, folder_name: &str, file_name: &str) -> bool {
        let folder = match self.folders.get_mut(folder_name) {
            Some(folder) => folder,
            None => match self.deleted_folders.get_mut(folder_name) {
                Some(folder) => folder,
                None => {
                    sys_log.error(format!("Unable to restore file {}. Folder {} does not exist.", file_name, folder_name));
                    return false;
                }
            },
        };
        folder.restore_file(sys_log, file_name)
    }

    pub fn move_file(&mut self, sys_log: &mut SysLog, src_folder: &str, file_name: &str, dst_folder: &str) -> bool {
        if self.get_file(src_folder, file_name).is_none() {
            sys_log.error(format!("Unable to move file. /{}/{} does not exist.", src_folder, file_name));
            return false;
        }
        if !self.folders.contains_key(dst_folder) && self.create_folder(sys_log, dst_folder).is_none() {
            return false;
        }
        if self.get_file(dst_folder, file_name).is_some() {
            sys_log.error(format!("Unable to move file. /{}/{} already exists.", dst_folder, file_name));
            return false;
        }
        let Some(file) = self.folders.get_mut(src_folder).and_then(|folder| folder.take_file(file_name)) else {
            return false;
        };
        match self.folders.get_mut(dst_folder) {
            Some(folder) => folder.add_file(sys_log, file),
            None => false,
        }
    }

    pub fn copy_file(&mut self, sys_log: &mut SysLog, src_folder: &str, file_name: &str, dst_folder: &str) -> bool {
        let Some(file) = self.get_file(src_folder, file_name).cloned() else {
            sys_log.error(format!("Unable to copy file. {} does not exist.", file_name));
            return false;
        };
        if !self.folders.contains_key(dst_folder) && self.create_folder(sys_log, dst_folder).is_none() {
            return false;
        }
        let Some(folder) = self.folders.get_mut(dst_folder) else {
            return false;
        };
        // copying over an existing file replaces it
        folder.files.remove(file_name);
        folder.add_file(sys_log, file)
    }

    pub fn scan(&mut self, sys_log: &mut SysLog, instant_scan: bool) {
        for folder in self.folders.values_mut() {
            folder.scan(sys_log, instant_scan);
        }
    }

    pub fn reveal_to_red(&mut self, sys_log: &mut SysLog, instant_scan: bool) {
        for folder in self.folders.values_mut() {
            folder.reveal_to_red(sys_log, instant_scan);
        }
    }

    pub fn pre_timestep(&mut self, timestep: u64) {
        self.num_file_creations = 0;
        self.num_file_deletions = 0;
        for folder in self.folders.values_mut() {
            folder.pre_timestep(timestep);
        }
    }

    pub fn apply_timestep(&mut self, sys_log: &mut SysLog, timestep: u64) {
        for folder in self.folders.values_mut() {
            folder.apply_timestep(sys_log, timestep);
        }
    }

    pub fn describe_state(&self) -> Value {
        let folders: serde_json::Map<String, Value> = self
            .folders
            .iter()
            .map(|(name, folder)| (name.clone(), folder.describe_state()))
            .collect();
        let deleted_folders: serde_json::Map<String, Value> = self
            .deleted_folders
            .iter()
            .map(|(name, folder)| (name.clone(), folder.describe_state()))
            .collect();
        json!({
            "folders": folders,
            "deleted_folders": deleted_folders,
            "num_file_creations": self.num_file_creations,
            "num_file_deletions": self.num_file_deletions,
        })
    }
}

impl RequestHandler<SysLog> for FileSystem {
    fn request_manager(&self) -> &RequestManager<Self, SysLog> {
        &self.request_manager
    }
}

fn folder_exists(fs: &FileSystem, _: &SysLog, request: &[RequestToken], _: &RequestContext) -> bool {
    request
        .first()
        .and_then(token_to_string)
        .map_or(false, |name| fs.get_folder_including_deleted(&name).is_some())
}

fn folder_not_deleted(fs: &FileSystem, _: &SysLog, request: &[RequestToken], _: &RequestContext) -> bool {
    request
        .first()
        .and_then(token_to_string)
        .map_or(false, |name| fs.get_folder(&name).is_some())
}

fn file_system_request_manager() -> RequestManager<FileSystem, SysLog> {
    fn route_folder(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let folder_name = arg_str(request, 0, "folder", "folder_name")?;
        match fs.folders.get_mut(&folder_name) {
            Some(folder) => folder.handle_request(sys_log, &request[1..], context),
            None => Ok(RequestResponse::failure().with_reason("Cannot perform request on a folder that does not exist.")),
        }
    }
    fn descend_folder(fs: &FileSystem, sys_log: &SysLog, request: &[RequestToken], context: &RequestContext) -> bool {
        match request.first().and_then(token_to_string).and_then(|name| fs.folders.get(&name)) {
            Some(folder) => folder.check_valid(sys_log, &request[1..], context),
            None => false,
        }
    }
    fn create_folder(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "create_folder")?;
        let folder_name = arg_str(request, 0, "create_folder", "folder_name")?;
        Ok(RequestResponse::from_bool(fs.create_folder(sys_log, &folder_name).is_some()))
    }
    fn create_file(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 2, "create_file")?;
        let folder_name = arg_str(request, 0, "create_file", "folder_name")?;
        let file_name = arg_str(request, 1, "create_file", "file_name")?;
        Ok(RequestResponse::from_bool(fs.create_file(sys_log, &folder_name, &file_name, None).is_some()))
    }
    fn delete_folder(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "delete_folder")?;
        let folder_name = arg_str(request, 0, "delete_folder", "folder_name")?;
        Ok(RequestResponse::from_bool(fs.delete_folder(sys_log, &folder_name)))
    }
    fn delete_file(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 2, "delete_file")?;
        let folder_name = arg_str(request, 0, "delete_file", "folder_name")?;
        let file_name = arg_str(request, 1, "delete_file", "file_name")?;
        Ok(RequestResponse::from_bool(fs.delete_file(sys_log, &folder_name, &file_name)))
    }
    fn restore_folder(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "restore_folder")?;
        let folder_name = arg_str(request, 0, "restore_folder", "folder_name")?;
        Ok(RequestResponse::from_bool(fs.restore_folder(sys_log, &folder_name)))
    }
    fn restore_file(fs: &mut FileSystem, sys_log: &mut SysLog, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 2, "restore_file")?;
        let folder_name = arg_str(request, 0, "restore_file", "folder_name")?;
        let file_name = arg_str(request, 1, "restore_file", "file_name")?;
        Ok(RequestResponse::from_bool(fs.restore_file(sys_log, &folder_name, &file_name)))
    }

    let folder_validator = Validator::new(folder_exists, "Cannot perform request on a folder that does not exist.")
        .and(Validator::new(folder_not_deleted, "Cannot perform request on a folder that is deleted."));

    RequestManager::new()
        .with("folder", RequestType::route(route_folder, descend_folder).with_validator(folder_validator))
        .with("create_folder", RequestType::new(create_folder))
        .with("create_file", RequestType::new(create_file))
        .with("delete_folder", RequestType::new(delete_folder))
        .with("delete_file", RequestType::new(delete_file))
        .with("restore_folder", RequestType::new(restore_folder))
        .with("restore_file", RequestType::new(restore_file))
}
