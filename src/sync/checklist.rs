//! Synchronization checklist
//!
//! The sorted list of proposed actions between one local and one remote tree.
//! Items are owned values; the list is built by collect and consumed by apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{ModificationPrecision, RemoteFile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecklistAction {
    #[default]
    None,
    UploadNew,
    UploadUpdate,
    DownloadNew,
    DownloadUpdate,
    DeleteRemote,
    DeleteLocal,
}

impl ChecklistAction {
    pub fn is_upload(self) -> bool {
        matches!(self, ChecklistAction::UploadNew | ChecklistAction::UploadUpdate)
    }

    pub fn is_download(self) -> bool {
        matches!(self, ChecklistAction::DownloadNew | ChecklistAction::DownloadUpdate)
    }
}

/// Snapshot of one side of an item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_name: String,
    /// Directory with a trailing separator
    pub directory: String,
    pub size: u64,
    pub modification: DateTime<Utc>,
    pub modification_precision: ModificationPrecision,
}

impl FileInfo {
    /// Only the directory is known
    pub fn in_directory(directory: &str) -> Self {
        Self {
            directory: directory.to_string(),
            ..Default::default()
        }
    }

    pub fn from_remote(file: &RemoteFile, directory: &str) -> Self {
        Self {
            file_name: file.name.clone(),
            directory: directory.to_string(),
            size: file.size,
            modification: file.modification,
            modification_precision: file.modification_precision,
        }
    }

    pub fn full_path(&self) -> String {
        format!("{}{}", self.directory, self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub action: ChecklistAction,
    pub is_directory: bool,
    pub local: FileInfo,
    pub remote: FileInfo,
    /// Selected for apply
    pub checked: bool,
    /// Listing entry of the remote side, when there is one
    pub remote_file: Option<RemoteFile>,
    /// Write time of the local file at full precision
    pub local_last_write_time: Option<DateTime<Utc>>,
}

impl Default for ChecklistItem {
    fn default() -> Self {
        Self {
            action: ChecklistAction::None,
            is_directory: false,
            local: FileInfo::default(),
            remote: FileInfo::default(),
            checked: true,
            remote_file: None,
            local_last_write_time: None,
        }
    }
}

impl ChecklistItem {
    /// Remote name when there is one, else the local name
    pub fn file_name(&self) -> &str {
        if !self.remote.file_name.is_empty() {
            &self.remote.file_name
        } else {
            &self.local.file_name
        }
    }

    /// Directory the item is grouped by
    fn sort_directory(&self) -> &str {
        if !self.local.directory.is_empty() {
            &self.local.directory
        } else {
            &self.remote.directory
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynchronizeChecklist {
    items: Vec<ChecklistItem>,
}

impl SynchronizeChecklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: ChecklistItem) {
        self.items.push(item);
    }

    /// Order by directory, then file name, both case-insensitive
    pub fn sort(&mut self) {
        self.items.sort_by_cached_key(|item| {
            (
                item.sort_directory().to_lowercase(),
                item.file_name().to_lowercase(),
            )
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    /// Items for unchecking before apply
    pub fn items_mut(&mut self) -> &mut [ChecklistItem] {
        &mut self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChecklistItem> {
        self.items.iter()
    }

    pub fn checked_count(&self) -> usize {
        self.items.iter().filter(|item| item.checked).count()
    }
}

impl IntoIterator for SynchronizeChecklist {
    type Item = ChecklistItem;
    type IntoIter = std::vec::IntoIter<ChecklistItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a SynchronizeChecklist {
    type Item = &'a ChecklistItem;
    type IntoIter = std::slice::Iter<'a, ChecklistItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(local_dir: &str, remote_dir: &str, local: &str, remote: &str) -> ChecklistItem {
        ChecklistItem {
            action: ChecklistAction::UploadNew,
            local: FileInfo {
                file_name: local.to_string(),
                ..FileInfo::in_directory(local_dir)
            },
            remote: FileInfo {
                file_name: remote.to_string(),
                ..FileInfo::in_directory(remote_dir)
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_file_name_prefers_remote() {
        assert_eq!(item("/l/", "/r/", "a.txt", "A.TXT").file_name(), "A.TXT");
        assert_eq!(item("/l/", "/r/", "a.txt", "").file_name(), "a.txt");
    }

    #[test]
    fn test_sort_is_case_insensitive() {
        let mut checklist = SynchronizeChecklist::new();
        checklist.add(item("/l/sub/", "/r/sub/", "b.txt", ""));
        checklist.add(item("/l/", "/r/", "", "B.txt"));
        checklist.add(item("/l/", "/r/", "a.txt", ""));
        checklist.add(item("/L/", "/r/", "c.txt", ""));
        checklist.sort();

        let order: Vec<(&str, &str)> = checklist
            .iter()
            .map(|i| (i.local.directory.as_str(), i.file_name()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("/l/", "a.txt"),
                ("/l/", "B.txt"),
                ("/L/", "c.txt"),
                ("/l/sub/", "b.txt"),
            ]
        );
    }

    #[test]
    fn test_checked_count() {
        let mut checklist = SynchronizeChecklist::new();
        checklist.add(item("/l/", "/r/", "a", ""));
        checklist.add(ChecklistItem {
            checked: false,
            ..item("/l/", "/r/", "b", "")
        });
        assert_eq!(checklist.checked_count(), 1);
        checklist.items_mut()[1].checked = true;
        assert_eq!(checklist.checked_count(), 2);
        assert_eq!(checklist.into_iter().count(), 2);
    }
}
