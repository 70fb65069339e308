//! Directory synchronization
//!
//! Two phases over a (local directory, remote directory) pair:
//! - collect: walk both trees and build a sorted [`SynchronizeChecklist`]
//! - apply: run the checked items through the session's transfer and delete
//!   operations, grouped by directory pair
//!
//! Decisions use existence, size and modification time only.

mod apply;
pub mod checklist;
mod collect;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

use crate::config::CopyParams;

pub use checklist::{ChecklistAction, ChecklistItem, FileInfo, SynchronizeChecklist};

/// Which side is brought up to date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizeMode {
    /// Remote directory follows the local one
    #[default]
    Remote,
    /// Local directory follows the remote one
    Local,
    /// Newer files win in both directions
    Both,
}

impl SynchronizeMode {
    /// Changes are uploaded
    pub fn updates_remote(self) -> bool {
        matches!(self, SynchronizeMode::Remote | SynchronizeMode::Both)
    }

    /// Changes are downloaded
    pub fn updates_local(self) -> bool {
        matches!(self, SynchronizeMode::Local | SynchronizeMode::Both)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeParams {
    /// Check deletions of files missing on the source side
    pub delete: bool,
    pub no_confirmation: bool,
    /// Only update files existing on both sides
    pub existing_only: bool,
    pub no_recurse: bool,
    /// Allow cached remote listings
    pub use_cache: bool,
    /// Report the directory only once work actually starts
    pub delay_progress: bool,
    /// Check new directories even without recursion
    pub sub_dirs: bool,
    /// Only bring modification times in line
    pub timestamp: bool,
    pub not_by_time: bool,
    pub by_size: bool,
    /// Older source files replace newer targets
    pub mirror: bool,
}

/// Name filter for change-triggered synchronization, applied at the first level
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynchronizeOptions {
    /// Sorted by lowercase name; `None` matches everything
    filter: Option<Vec<String>>,
}

impl SynchronizeOptions {
    pub fn with_filter<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter: Vec<String> = names.into_iter().map(Into::into).collect();
        filter.sort_by_key(|name| name.to_lowercase());
        Self {
            filter: Some(filter),
        }
    }

    pub fn matches_filter(&self, file_name: &str) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => {
                let key = file_name.to_lowercase();
                filter
                    .binary_search_by(|name| name.to_lowercase().cmp(&key))
                    .is_ok()
            }
        }
    }
}

/// One synchronization between a local and a remote directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeRequest {
    pub local_directory: String,
    pub remote_directory: String,
    pub mode: SynchronizeMode,
    pub params: SynchronizeParams,
    pub copy_param: CopyParams,
    pub options: Option<SynchronizeOptions>,
}

impl SynchronizeRequest {
    pub fn new(local_directory: &str, remote_directory: &str, mode: SynchronizeMode) -> Self {
        Self {
            local_directory: local_directory.to_string(),
            remote_directory: remote_directory.to_string(),
            mode,
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: SynchronizeParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_copy_param(mut self, copy_param: CopyParams) -> Self {
        self.copy_param = copy_param;
        self
    }

    pub fn with_options(mut self, options: SynchronizeOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Directory progress: `(local, remote, &mut continue, collecting)`.
/// Clearing `continue` aborts the synchronization.
pub type SynchronizeDirectory<'a> = dyn FnMut(&str, &str, &mut bool, bool) + Send + 'a;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_case_insensitive() {
        let options = SynchronizeOptions::with_filter(["b.txt", "A.txt", "docs"]);
        assert!(options.matches_filter("a.TXT"));
        assert!(options.matches_filter("docs"));
        assert!(!options.matches_filter("c.txt"));
        assert!(SynchronizeOptions::default().matches_filter("anything"));
    }

    #[test]
    fn test_params_from_json() {
        let params: SynchronizeParams =
            serde_json::from_str(r#"{"delete": true, "mirror": true}"#).unwrap();
        assert!(params.delete && params.mirror);
        assert!(!params.timestamp);
        assert!(SynchronizeMode::Both.updates_local() && SynchronizeMode::Both.updates_remote());
        assert!(!SynchronizeMode::Remote.updates_local());
    }
}
