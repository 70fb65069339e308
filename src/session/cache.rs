//! Directory listing cache and directory change cache
//!
//! Both caches are owned by one session and never shared, so no locking.

use std::collections::{HashMap, VecDeque};

use crate::backend::RemoteFileList;
use crate::path_utils::{
    expand_remote_file_name, is_absolute_remote_path, unix_exclude_trailing_slash,
    unix_extract_file_dir, unix_extract_file_name,
};

/// Last known listing per remote directory
#[derive(Debug, Default)]
pub struct DirectoryCache {
    lists: HashMap<String, RemoteFileList>,
}

fn cache_key(path: &str) -> String {
    unix_exclude_trailing_slash(path)
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn has_file_list(&self, directory: &str) -> bool {
        self.lists.contains_key(&cache_key(directory))
    }

    /// Is a listing cached that was loaded after `timestamp`
    pub fn has_newer_file_list(&self, directory: &str, timestamp: u64) -> bool {
        self.lists
            .get(&cache_key(directory))
            .map(|list| list.timestamp() > timestamp)
            .unwrap_or(false)
    }

    pub fn get_file_list(&self, directory: &str) -> Option<RemoteFileList> {
        self.lists.get(&cache_key(directory)).cloned()
    }

    pub fn add_file_list(&mut self, list: &RemoteFileList) {
        self.lists.insert(cache_key(list.directory()), list.clone());
    }

    /// Drop the listing of `directory`, and of everything below it when `sub_dirs`
    pub fn clear_file_list(&mut self, directory: &str, sub_dirs: bool) {
        let key = cache_key(directory);
        self.lists.remove(&key);
        if sub_dirs {
            let prefix = if key.ends_with('/') {
                key
            } else {
                format!("{}/", key)
            };
            self.lists.retain(|k, _| !k.starts_with(&prefix));
        }
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }
}

/// Marks an entry whose key is itself the resolved target
const SELF_TARGET: &str = "//";

/// Remembers where a `cd` typed from a given directory ended up
///
/// Entries are kept in insertion order; the oldest entry goes first when the
/// cache is full.
#[derive(Debug)]
pub struct DirectoryChangesCache {
    entries: VecDeque<(String, String)>,
    max_size: usize,
}

impl DirectoryChangesCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == name)
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_value(&mut self, name: String, value: String) {
        if let Some(index) = self.index_of(&name) {
            self.entries.remove(index);
        }
        self.entries.push_back((name, value));
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    fn change_key(source: &str, change: &str) -> Option<String> {
        if change.is_empty() {
            return None;
        }
        if is_absolute_remote_path(change) {
            Some(change.to_string())
        } else if source.is_empty() {
            None
        } else {
            Some(format!("{},{}", source, change))
        }
    }

    /// Record that `change` typed in `source` resolved to `target`
    pub fn add_directory_change(&mut self, source: &str, change: &str, target: &str) {
        if target.is_empty() {
            return;
        }
        self.set_value(target.to_string(), SELF_TARGET.to_string());
        if expand_remote_file_name(change, source) != target {
            if let Some(key) = Self::change_key(source, change) {
                self.set_value(key, target.to_string());
            }
        }
    }

    /// Resolved target of `change` typed in `source`, if known
    pub fn get_directory_change(&self, source: &str, change: &str) -> Option<String> {
        let mut key = expand_remote_file_name(change, source);
        if key.is_empty() {
            key = "/".to_string();
        }
        if let Some(value) = self.value(&key) {
            return Some(if value == SELF_TARGET {
                key
            } else {
                value.to_string()
            });
        }
        let key = Self::change_key(source, change)?;
        self.value(&key)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    }

    /// Forget changes made from `source` (and below)
    pub fn clear_directory_change(&mut self, source: &str) {
        self.entries.retain(|(name, _)| !name.starts_with(source));
    }

    /// Forget every change leading into `target` (and below)
    pub fn clear_directory_change_target(&mut self, target: &str) {
        // a deleted symlink leaves its own key behind
        let symlink_key = Self::change_key(
            &unix_exclude_trailing_slash(&unix_extract_file_dir(target)),
            &unix_extract_file_name(target),
        );
        self.entries.retain(|(name, value)| {
            !(name.starts_with(target)
                || value.starts_with(target)
                || symlink_key.as_deref() == Some(name.as_str()))
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemoteFile;
    use chrono::Utc;

    #[test]
    fn test_directory_cache_subdirs() {
        let mut cache = DirectoryCache::new();
        for dir in ["/home/user", "/home/user/a", "/home/user/a/b", "/home/userx"] {
            let mut list = RemoteFileList::new(dir);
            list.add_file(RemoteFile::file("f", 1, Utc::now()));
            cache.add_file_list(&list);
        }
        assert!(cache.has_file_list("/home/user/"));
        cache.clear_file_list("/home/user/a", false);
        assert!(!cache.has_file_list("/home/user/a"));
        assert!(cache.has_file_list("/home/user/a/b"));
        cache.clear_file_list("/home/user", true);
        assert!(!cache.has_file_list("/home/user/a/b"));
        assert!(cache.has_file_list("/home/userx"));
    }

    #[test]
    fn test_newer_file_list() {
        let mut cache = DirectoryCache::new();
        let older = RemoteFileList::new("/x");
        let mut cached = RemoteFileList::new("/x");
        cached.touch();
        cache.add_file_list(&cached);
        assert!(cache.has_newer_file_list("/x", older.timestamp()));
        assert!(!cache.has_newer_file_list("/x", cached.timestamp()));
        assert_eq!(cache.get_file_list("/x/").unwrap().timestamp(), cached.timestamp());
    }

    #[test]
    fn test_directory_change_resolution() {
        let mut cache = DirectoryChangesCache::new(10);
        cache.add_directory_change("/home/user", "www", "/var/www");
        assert_eq!(
            cache.get_directory_change("/home/user", "www").as_deref(),
            Some("/var/www")
        );
        // the target itself resolves to itself
        assert_eq!(
            cache.get_directory_change("/", "/var/www").as_deref(),
            Some("/var/www")
        );
        assert_eq!(cache.get_directory_change("/home/user", "other"), None);

        cache.add_directory_change("/home/user", "docs", "/home/user/docs");
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_directory_change_eviction() {
        let mut cache = DirectoryChangesCache::new(2);
        cache.add_directory_change("/a", "x", "/t1");
        cache.add_directory_change("/a", "y", "/t2");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_directory_change("/a", "x"), None);
        assert_eq!(cache.get_directory_change("/a", "y").as_deref(), Some("/t2"));
    }

    #[test]
    fn test_clear_directory_change_target() {
        let mut cache = DirectoryChangesCache::new(10);
        cache.add_directory_change("/home/user", "link", "/data/real");
        cache.add_directory_change("/srv", "x", "/opt/x");
        cache.clear_directory_change_target("/data");
        assert_eq!(cache.get_directory_change("/home/user", "link"), None);
        assert!(cache.get_directory_change("/srv", "x").is_some());

        cache.clear_directory_change("/srv");
        assert!(cache.get_directory_change("/srv", "x").is_none());
    }
}
