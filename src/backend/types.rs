//! Remote file system data types

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::path_utils::{join_remote_path, unix_include_trailing_slash};

/// Optional features a backend may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    UserGroupListing,
    ModeChanging,
    GroupChanging,
    OwnerChanging,
    GroupOwnerChangingByID,
    AnyCommand,
    HardLink,
    SymbolicLink,
    ResolveSymlink,
    TextMode,
    Rename,
    NativeTextMode,
    NewerOnlyUpload,
    RemoteCopy,
    TimestampChanging,
    RemoteMove,
    LoadingAdditionalProperties,
    CheckingSpaceAvailable,
    IgnorePermErrors,
    CalculatingChecksum,
    ModeChangingUpload,
    PreservingTimestampUpload,
    ShellAnyCommand,
    SecondaryShell,
    RemoveCtrlZUpload,
    RemoveBOMUpload,
    MoveToQueue,
    Locking,
    PreservingTimestampDirs,
    ResumeSupport,
    ChangePassword,
    SkipTransfer,
    ParallelTransfers,
    BackgroundTransfers,
}

/// How precise a reported modification time is, from coarsest to finest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ModificationPrecision {
    /// No usable timestamp
    None,
    /// Date only
    Date,
    /// Up to minutes
    Minutes,
    /// Full precision
    #[default]
    Full,
}

impl ModificationPrecision {
    /// The coarser of two precisions
    pub fn coarser(self, other: Self) -> Self {
        self.min(other)
    }

    /// Drop the parts of `time` this precision cannot represent.
    ///
    /// Full precision is truncated to whole seconds.
    pub fn reduce(self, time: DateTime<Utc>) -> DateTime<Utc> {
        let truncated = match self {
            ModificationPrecision::Full => time.with_nanosecond(0),
            ModificationPrecision::Minutes => time
                .with_nanosecond(0)
                .and_then(|t| t.with_second(0)),
            ModificationPrecision::Date => Utc
                .with_ymd_and_hms(time.year(), time.month(), time.day(), 0, 0, 0)
                .single(),
            ModificationPrecision::None => Utc.timestamp_opt(0, 0).single(),
        };
        truncated.unwrap_or(time)
    }
}

/// Compare two modification times at the coarser of both precisions
pub fn compare_file_time(
    a: DateTime<Utc>,
    a_precision: ModificationPrecision,
    b: DateTime<Utc>,
    b_precision: ModificationPrecision,
) -> Ordering {
    let precision = a_precision.coarser(b_precision);
    precision
        .reduce(a)
        .timestamp()
        .cmp(&precision.reduce(b).timestamp())
}

/// User or group identity on the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteToken {
    pub name: String,
    pub id: Option<u32>,
}

impl RemoteToken {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(id: u32) -> Self {
        Self {
            name: id.to_string(),
            id: Some(id),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.name.is_empty() || self.id.is_some()
    }

    pub fn display_text(&self) -> String {
        match (self.name.is_empty(), self.id) {
            (false, _) => self.name.clone(),
            (true, Some(id)) => id.to_string(),
            (true, None) => String::new(),
        }
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    /// Path of the listing this entry came from (with trailing slash)
    pub directory: String,
    pub size: u64,
    pub modification: DateTime<Utc>,
    pub modification_precision: ModificationPrecision,
    pub owner: RemoteToken,
    pub group: RemoteToken,
    /// Permission bits (`0o755`)
    pub permissions: Option<u32>,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub link_target: Option<String>,
}

impl RemoteFile {
    pub fn file(name: impl Into<String>, size: u64, modification: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            directory: String::new(),
            size,
            modification,
            modification_precision: ModificationPrecision::Full,
            owner: RemoteToken::default(),
            group: RemoteToken::default(),
            permissions: Some(0o644),
            is_directory: false,
            is_symlink: false,
            link_target: None,
        }
    }

    pub fn directory(name: impl Into<String>, modification: DateTime<Utc>) -> Self {
        Self {
            is_directory: true,
            permissions: Some(0o755),
            ..Self::file(name, 0, modification)
        }
    }

    pub fn full_path(&self) -> String {
        join_remote_path(&self.directory, &self.name)
    }

    pub fn is_parent_directory(&self) -> bool {
        self.name == ".."
    }

    pub fn is_this_directory(&self) -> bool {
        self.name == "."
    }

    /// Permission bits as `rwxr-xr-x`
    pub fn rights_text(&self) -> String {
        let Some(mode) = self.permissions else {
            return String::new();
        };
        let mut text = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            text.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            text.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            text.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        text
    }
}

static LIST_TIMESTAMP: AtomicU64 = AtomicU64::new(1);

fn next_list_timestamp() -> u64 {
    LIST_TIMESTAMP.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Listing of one remote directory, stamped with a logical timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFileList {
    directory: String,
    timestamp: u64,
    files: Vec<RemoteFile>,
}

impl Default for RemoteFileList {
    fn default() -> Self {
        Self::new("")
    }
}

impl RemoteFileList {
    pub fn new(directory: &str) -> Self {
        Self {
            directory: unix_include_trailing_slash(directory),
            timestamp: next_list_timestamp(),
            files: Vec::new(),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn set_directory(&mut self, directory: &str) {
        self.directory = unix_include_trailing_slash(directory);
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Mark the listing as freshly loaded
    pub fn touch(&mut self) {
        self.timestamp = next_list_timestamp();
    }

    pub fn add_file(&mut self, mut file: RemoteFile) {
        file.directory = self.directory.clone();
        self.files.push(file);
    }

    pub fn files(&self) -> &[RemoteFile] {
        &self.files
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    pub fn find_file(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.touch();
    }

    pub fn retain(&mut self, keep: impl FnMut(&RemoteFile) -> bool) {
        self.files.retain(keep);
    }

    /// Entries other than `.` and `..`
    pub fn real_files(&self) -> impl Iterator<Item = &RemoteFile> {
        self.files
            .iter()
            .filter(|f| !f.is_parent_directory() && !f.is_this_directory())
    }
}

/// Properties to change on a remote file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteProperties {
    pub modes: Option<u32>,
    pub owner: Option<RemoteToken>,
    pub group: Option<RemoteToken>,
    pub modification: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
    /// Apply to directory contents too
    pub recursive: bool,
}

impl RemoteProperties {
    pub fn is_empty(&self) -> bool {
        self.modes.is_none()
            && self.owner.is_none()
            && self.group.is_none()
            && self.modification.is_none()
            && self.last_access.is_none()
    }

    pub fn modification(time: DateTime<Utc>) -> Self {
        Self {
            modification: Some(time),
            last_access: Some(time),
            ..Default::default()
        }
    }
}

/// Static description of a connected file system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSystemInfo {
    pub protocol_base_name: String,
    pub protocol_name: String,
    pub remote_system: String,
    pub additional_info: String,
    pub capabilities: Vec<Capability>,
}

/// Connection-level information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub protocol_name: String,
    pub security_protocol_name: String,
    pub host_key_fingerprint: Option<String>,
}

/// Free space report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceAvailable {
    pub bytes_on_device: u64,
    pub unused_bytes_on_device: u64,
    pub bytes_available_to_user: u64,
    pub bytes_per_allocation_unit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, s).unwrap()
    }

    #[test]
    fn test_precision_order() {
        assert!(ModificationPrecision::None < ModificationPrecision::Date);
        assert!(ModificationPrecision::Minutes < ModificationPrecision::Full);
        assert_eq!(
            ModificationPrecision::Full.coarser(ModificationPrecision::Minutes),
            ModificationPrecision::Minutes
        );
    }

    #[test]
    fn test_compare_at_coarser_precision() {
        let a = at(10, 30, 15);
        let b = at(10, 30, 45);
        assert_eq!(
            compare_file_time(a, ModificationPrecision::Full, b, ModificationPrecision::Full),
            Ordering::Less
        );
        assert_eq!(
            compare_file_time(a, ModificationPrecision::Full, b, ModificationPrecision::Minutes),
            Ordering::Equal
        );
        assert_eq!(
            compare_file_time(at(1, 0, 0), ModificationPrecision::Date, at(23, 0, 0), ModificationPrecision::Full),
            Ordering::Equal
        );
    }

    #[test]
    fn test_sub_second_difference_is_equal() {
        let a = at(10, 0, 0);
        let b = a + chrono::Duration::milliseconds(400);
        assert_eq!(
            compare_file_time(a, ModificationPrecision::Full, b, ModificationPrecision::Full),
            Ordering::Equal
        );
    }

    #[test]
    fn test_file_list() {
        let mut list = RemoteFileList::new("/home/user");
        assert_eq!(list.directory(), "/home/user/");
        let before = list.timestamp();
        list.add_file(RemoteFile::directory("..", at(0, 0, 0)));
        list.add_file(RemoteFile::file("a.txt", 10, at(0, 0, 0)));
        assert_eq!(list.find_file("a.txt").unwrap().full_path(), "/home/user/a.txt");
        assert_eq!(list.real_files().count(), 1);
        list.touch();
        assert!(list.timestamp() > before);
    }

    #[test]
    fn test_rights_text() {
        let mut file = RemoteFile::file("x", 0, at(0, 0, 0));
        file.permissions = Some(0o750);
        assert_eq!(file.rights_text(), "rwxr-x---");
    }
}
