//! Current directory, listings and the listing caches
//!
//! Internally every path is the backend's real path. Paths are translated to and
//! from the locked view (`lock_in_home`) only at the public accessors.

use tracing::debug;

use super::{FsCommand, QueryAnswers, Session, SessionError, SessionStatus};
use crate::backend::{RemoteFile, RemoteFileList};
use crate::config::FileMask;
use crate::path_utils::{
    expand_remote_file_name, join_remote_path, to_unix_path, unix_exclude_trailing_slash,
    unix_extract_file_dir, unix_extract_file_name, unix_include_trailing_slash, unix_is_child_path,
    unix_same_path,
};
use crate::session::action_log::ActionKind;
use crate::session::command::ParentNotice;

impl Session {
    /// Current directory as last read, without asking the server
    pub(crate) fn remote_current_directory(&mut self) -> String {
        if self.current_directory.is_empty() {
            if let Some(backend) = self.backend.as_ref() {
                self.current_directory = backend.current_directory();
            }
        }
        self.current_directory.clone()
    }

    /// Backend's current directory, read from the server when unknown
    pub(crate) async fn working_directory(&mut self) -> Result<String, SessionError> {
        let current = self.remote_current_directory();
        if current.is_empty() && self.backend.is_some() {
            self.read_current_directory().await?;
            return Ok(self.remote_current_directory());
        }
        Ok(current)
    }

    /// Current directory as the user sees it, read from the server when unknown
    pub async fn current_directory(&mut self) -> Result<String, SessionError> {
        let current = self.working_directory().await?;
        Ok(self.translate_locked_path(&current, true))
    }

    /// Current directory as the user sees it, never touching the server
    pub fn peek_current_directory(&mut self) -> String {
        let current = self.remote_current_directory();
        self.translate_locked_path(&current, true)
    }

    /// Map between real paths and paths inside the home lock.
    ///
    /// `lock` strips the lock directory, otherwise it is prepended.
    pub fn translate_locked_path(&self, path: &str, lock: bool) -> String {
        if !self.data.lock_in_home || !path.starts_with('/') {
            return path.to_string();
        }
        if lock {
            if !self.lock_directory.is_empty() && unix_is_child_path(&self.lock_directory, path) {
                let rest = &path[unix_exclude_trailing_slash(&self.lock_directory).len()..];
                return if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                };
            }
            path.to_string()
        } else {
            unix_exclude_trailing_slash(&format!(
                "{}{}",
                unix_exclude_trailing_slash(&self.lock_directory),
                path
            ))
        }
    }

    /// Path relative to the current directory made absolute
    pub fn absolute_path(&mut self, path: &str) -> String {
        let current = self.remote_current_directory();
        expand_remote_file_name(path, &current)
    }

    pub async fn set_current_directory(&mut self, directory: &str) -> Result<(), SessionError> {
        let target = self.translate_locked_path(directory, false);
        if target != self.remote_current_directory() {
            self.change_directory(&target).await?;
        }
        Ok(())
    }

    // ---- callbacks ----

    async fn do_change_directory_callback(&mut self, directory: &str) -> Result<(), SessionError> {
        let shown = self.translate_locked_path(directory, true);
        self.guarded(|cb| cb.change_directory(&shown)).await
    }

    async fn do_start_read_directory(&mut self, directory: &str) -> Result<(), SessionError> {
        let shown = self.translate_locked_path(directory, true);
        self.guarded(|cb| cb.start_read_directory(&shown)).await
    }

    async fn do_read_directory_callback(&mut self, reload_only: bool) -> Result<(), SessionError> {
        let shown = self.translate_locked_path(self.files.directory(), true);
        self.guarded(|cb| cb.read_directory(&shown, reload_only)).await
    }

    // ---- current directory ----

    pub async fn read_current_directory(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.do_read_current_directory().await {
            self.command_error(e, "Error getting name of current remote directory", QueryAnswers::NONE)
                .await?;
        }
        Ok(())
    }

    async fn do_read_current_directory(&mut self) -> Result<(), SessionError> {
        // may be called outside a transaction flush
        self.pending_read_current_directory = false;

        debug!("Getting current directory name");
        let old = self.current_directory.clone();
        let backend = self.backend_mut()?;
        backend.read_current_directory().await?;
        let current = backend.current_directory();
        self.current_directory = current.clone();

        if let Some(cache) = self.directory_changes_cache.as_mut() {
            if !current.is_empty() && !self.last_directory_change.is_empty() && current != old {
                cache.add_directory_change(&old, &self.last_directory_change, &current);
            }
            // a change not made through change_directory must not be recorded
            self.last_directory_change.clear();
        }

        if old.is_empty() {
            self.lock_directory = if self.data.lock_in_home {
                current.clone()
            } else {
                String::new()
            };
        }
        if old != current {
            self.do_change_directory_callback(&current).await?;
        }
        Ok(())
    }

    pub async fn change_directory(&mut self, directory: &str) -> Result<(), SessionError> {
        let normalized = to_unix_path(directory);
        if let Err(e) = self.do_change_directory(&normalized).await {
            let message = format!("Error changing directory to '{}'", normalized);
            self.command_error(e, &message, QueryAnswers::NONE).await?;
        }
        Ok(())
    }

    async fn do_change_directory(&mut self, directory: &str) -> Result<(), SessionError> {
        // the cache is never used during startup so we never end up in a stale directory
        let cached = if self.status == SessionStatus::Opened {
            let current = self.remote_current_directory();
            self.directory_changes_cache
                .as_ref()
                .and_then(|cache| cache.get_directory_change(&current, directory))
        } else {
            None
        };
        match cached {
            Some(target) => {
                debug!("Cached directory change via '{}' to '{}'", directory, target);
                self.backend_mut()?.cached_change_directory(&target).await?;
            }
            None => {
                debug!("Changing directory to '{}'", directory);
                self.backend_mut()?.change_directory(directory).await?;
            }
        }
        self.last_directory_change = directory.to_string();
        self.react_on_command(FsCommand::ChangeDirectory).await
    }

    pub async fn home_directory(&mut self) -> Result<(), SessionError> {
        let result = async {
            debug!("Changing directory to home directory");
            self.backend_mut()?.home_directory().await?;
            self.react_on_command(FsCommand::HomeDirectory).await
        }
        .await;
        if let Err(e) = result {
            self.command_error(e, "Error changing directory to home directory", QueryAnswers::NONE)
                .await?;
        }
        Ok(())
    }

    // ---- listings ----

    /// Load the listing of the current directory into `files`
    pub async fn read_directory(&mut self, reload_only: bool, force_cache: bool) -> Result<(), SessionError> {
        let directory = self.working_directory().await?;
        let mut loaded_from_cache = false;

        if self.data.cache_directories && self.directory_cache.has_file_list(&directory) {
            if reload_only && !force_cache {
                debug!("Cached directory not reloaded");
            } else {
                self.do_start_read_directory(&directory).await?;
                if let Some(list) = self.directory_cache.get_file_list(&directory) {
                    self.files = list;
                    loaded_from_cache = true;
                }
                self.do_read_directory_callback(reload_only).await?;
                if loaded_from_cache {
                    debug!("Directory content loaded from cache");
                } else {
                    debug!("Cached directory content has been removed");
                }
            }
        }

        if !loaded_from_cache {
            self.do_start_read_directory(&directory).await?;
            let mut list = RemoteFileList::new(&directory);
            let result = self.custom_read_directory(&mut list).await;
            // the new list replaces the old one even when the read failed
            self.files = list;
            let notified = self.do_read_directory_callback(reload_only).await;
            if self.is_active() && self.data.cache_directories {
                let files = self.files.clone();
                self.directory_loaded(&files);
            }
            let result = match (result, notified) {
                (_, Err(e)) if e.is_fatal() => Err(e),
                (Err(e), _) | (Ok(()), Err(e)) => Err(e),
                (Ok(()), Ok(())) => Ok(()),
            };
            if let Err(e) = result {
                let message = format!("Error listing directory '{}'", directory);
                self.command_error(e, &message, QueryAnswers::NONE).await?;
            }
        }
        Ok(())
    }

    async fn custom_read_directory(&mut self, list: &mut RemoteFileList) -> Result<(), SessionError> {
        self.backend_mut()?.read_directory(list).await?;
        list.touch();
        debug!("Read {} entries of '{}'", list.count(), list.directory());
        Ok(())
    }

    /// Read `list.directory()`, reporting failures without raising them
    async fn read_directory_into(&mut self, list: &mut RemoteFileList) -> Result<(), SessionError> {
        if let Err(e) = self.custom_read_directory(list).await {
            let message = format!("Error listing directory '{}'", list.directory());
            self.command_error(e, &message, QueryAnswers::NONE).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_read_directory_listing(
        &mut self,
        directory: &str,
        use_cache: bool,
    ) -> Result<RemoteFileList, SessionError> {
        let cache = use_cache && self.data.cache_directories;
        if cache {
            if let Some(list) = self.directory_cache.get_file_list(directory) {
                return Ok(list);
            }
        }
        let mut list = RemoteFileList::new(directory);
        self.set_exception_on_fail(true);
        let result = self.read_directory_into(&mut list).await;
        self.set_exception_on_fail(false);
        result?;
        if cache {
            self.directory_cache.add_file_list(&list);
        }
        Ok(list)
    }

    /// Listing of any directory, asking Retry/Skip/Abort on failure
    pub async fn custom_read_directory_listing(
        &mut self,
        directory: &str,
        use_cache: bool,
    ) -> Result<RemoteFileList, SessionError> {
        loop {
            match self.do_read_directory_listing(directory, use_cache).await {
                Ok(list) => return Ok(list),
                Err(e) => {
                    let message = format!("Error listing directory '{}'", directory);
                    self.retry_query(e, &message, None).await?
                }
            }
        }
    }

    /// Fresh listing of `directory` with entries outside `mask` dropped
    pub async fn read_directory_listing(
        &mut self,
        directory: &str,
        mask: &FileMask,
    ) -> Result<RemoteFileList, SessionError> {
        let path = self.absolute_path(directory);
        let action = self.action_log.begin(ActionKind::Ls, &path, None);
        loop {
            match self.do_read_directory_listing(directory, false).await {
                Ok(mut list) => {
                    list.retain(|f| mask.matches(&f.name, f.is_directory));
                    let names: Vec<String> = list.files().iter().map(|f| f.name.clone()).collect();
                    self.action_log.add_output(action, &names);
                    self.action_log.commit(action);
                    return Ok(list);
                }
                Err(e) => {
                    let message = format!("Error listing directory '{}'", directory);
                    self.retry_query(e, &message, action).await?
                }
            }
        }
    }

    /// Attributes of one file; `None` when the failure was reported to the user
    pub async fn read_file(&mut self, file_name: &str) -> Result<Option<RemoteFile>, SessionError> {
        debug!("Listing file '{}'", file_name);
        let result = async { Ok::<_, SessionError>(self.backend_mut()?.read_file(file_name).await?) }.await;
        match result {
            Ok(file) => Ok(Some(file)),
            Err(e) => {
                let message = format!("Can't get attributes of file '{}'", file_name);
                self.command_error(e, &message, QueryAnswers::NONE).await?;
                Ok(None)
            }
        }
    }

    /// Resolved target of a symlink
    pub async fn read_symlink(&mut self, file: &RemoteFile) -> Result<Option<RemoteFile>, SessionError> {
        debug!("Reading symlink '{}'", file.name);
        let result = async { Ok::<_, SessionError>(self.backend_mut()?.read_symlink(file).await?) }.await;
        match result {
            Ok(target) => Ok(Some(target)),
            Err(e) => {
                let message = format!("Error reading symlink '{}'", file.name);
                self.command_error(e, &message, QueryAnswers::NONE).await?;
                Ok(None)
            }
        }
    }

    /// Attributes of a file that may not exist
    pub async fn stat_file(&mut self, file_name: &str) -> Result<Option<RemoteFile>, SessionError> {
        self.set_exception_on_fail(true);
        let result = self.read_file(file_name).await;
        self.set_exception_on_fail(false);
        match result {
            Ok(file) => Ok(file),
            Err(e) if self.is_active() => {
                debug!("File '{}' does not exist: {}", file_name, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn file_exists(&mut self, file_name: &str) -> Result<bool, SessionError> {
        Ok(self.stat_file(file_name).await?.is_some())
    }

    /// Entries of `directory` (without `.` and `..`) with their full paths.
    ///
    /// With `ignore_errors` a failed listing yields nothing, unless the connection
    /// was lost.
    pub async fn process_directory(
        &mut self,
        directory: &str,
        use_cache: bool,
        ignore_errors: bool,
    ) -> Result<Vec<(String, RemoteFile)>, SessionError> {
        let list = if ignore_errors {
            self.set_exception_on_fail(true);
            let result = self.custom_read_directory_listing(directory, use_cache).await;
            self.set_exception_on_fail(false);
            match result {
                Ok(list) => Some(list),
                Err(e) if self.is_active() => {
                    debug!("Ignoring listing error of '{}': {}", directory, e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            Some(self.custom_read_directory_listing(directory, use_cache).await?)
        };

        let prefix = unix_include_trailing_slash(directory);
        Ok(list
            .map(|list| {
                list.real_files()
                    .map(|f| (format!("{}{}", prefix, f.name), f.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Best known listing of `path` newer than the caller's copy.
    ///
    /// `timestamp` is the timestamp of the caller's list, `None` when it has none.
    /// A directory is loaded only when `can_load` and no cached version exists.
    pub async fn directory_file_list(
        &mut self,
        path: &str,
        timestamp: Option<u64>,
        can_load: bool,
    ) -> Result<Option<RemoteFileList>, SessionError> {
        if unix_same_path(self.files.directory(), path) {
            let newer = timestamp.map(|t| t < self.files.timestamp()).unwrap_or(true);
            return Ok(newer.then(|| self.files.clone()));
        }
        let cached = match timestamp {
            None => self.directory_cache.has_file_list(path),
            Some(t) => self.directory_cache.has_newer_file_list(path, t),
        };
        if cached {
            return Ok(self.directory_cache.get_file_list(path));
        }
        // only a missing cache entry marks the content as obsolete
        if can_load && !self.directory_cache.has_file_list(path) {
            let mut list = RemoteFileList::new(path);
            self.read_directory_into(&mut list).await?;
            return Ok(Some(list));
        }
        Ok(None)
    }

    /// Drop cached knowledge of the current directory and read it again
    pub async fn reload_directory(&mut self) -> Result<(), SessionError> {
        let current = self.working_directory().await?;
        if self.data.cache_directories {
            self.directory_modified(&current, false);
        }
        if let Some(cache) = self.directory_changes_cache.as_mut() {
            cache.clear_directory_change(&current);
        }
        self.read_current_directory().await?;
        self.pending_read_current_directory = false;
        self.read_directory(true, false).await?;
        self.pending_read_directory = false;
        Ok(())
    }

    /// Pick up a newer cached listing of the current directory
    pub async fn refresh_directory(&mut self) -> Result<(), SessionError> {
        let current = self.working_directory().await?;
        if self.data.cache_directories
            && self
                .directory_cache
                .has_newer_file_list(&current, self.files.timestamp())
        {
            self.read_directory(true, true).await?;
            self.pending_read_directory = false;
        }
        Ok(())
    }

    /// Invalidate cached knowledge about a file about to be modified
    pub fn file_modified(&mut self, file: Option<&RemoteFile>, file_name: &str, clear_directory_change: bool) {
        let mut parent = String::new();
        let mut directory = String::new();

        if self.data.cache_directories || self.data.cache_directory_changes {
            match file {
                Some(file) if !file.directory.is_empty() => {
                    if file.is_directory {
                        directory = file.full_path();
                    }
                    parent = file.directory.clone();
                }
                _ if !file_name.is_empty() => {
                    parent = unix_extract_file_dir(file_name);
                    if parent.is_empty() {
                        parent = self.remote_current_directory();
                    }
                    if let Some(file) = file.filter(|f| f.is_directory) {
                        directory = join_remote_path(
                            &unix_include_trailing_slash(&parent),
                            &unix_extract_file_name(&file.name),
                        );
                    }
                }
                _ => {}
            }
        }

        if self.data.cache_directories {
            if !directory.is_empty() {
                self.directory_modified(&directory, true);
            }
            if !parent.is_empty() {
                self.directory_modified(&parent, false);
            }
        }

        if clear_directory_change && !directory.is_empty() {
            if let Some(cache) = self.directory_changes_cache.as_mut() {
                cache.clear_directory_change(&directory);
                cache.clear_directory_change_target(&directory);
            }
        }
    }

    /// Forget the cached listing of `path` (the current directory when empty)
    pub fn directory_modified(&mut self, path: &str, sub_dirs: bool) {
        let path = if path.is_empty() {
            self.remote_current_directory()
        } else {
            path.to_string()
        };
        self.directory_cache.clear_file_list(&path, sub_dirs);
        if let Some(link) = self.secondary.as_ref() {
            link.notify(ParentNotice::DirectoryModified { path, sub_dirs });
        }
    }

    /// A listing was loaded; the command session hands it to its parent
    pub fn directory_loaded(&mut self, list: &RemoteFileList) {
        match self.secondary.as_ref() {
            Some(link) => link.notify(ParentNotice::DirectoryLoaded(list.clone())),
            None => self.directory_cache.add_file_list(list),
        }
    }

    pub fn clear_caches(&mut self) {
        self.directory_cache.clear();
        if let Some(cache) = self.directory_changes_cache.as_mut() {
            cache.clear();
        }
    }

    /// Fail when `file_name` already exists in the current listing
    pub(crate) fn ensure_non_existence(&mut self, file_name: &str) -> Result<(), SessionError> {
        let current = self.remote_current_directory();
        if !unix_extract_file_dir(file_name).is_empty() || !unix_same_path(&current, self.files.directory()) {
            return Ok(());
        }
        match self.files.find_file(file_name) {
            Some(file) if file.is_directory => Err(SessionError::Command(format!(
                "Directory '{}' already exists",
                file_name
            ))),
            Some(_) => Err(SessionError::Command(format!("File '{}' already exists", file_name))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{
        memory_session, memory_session_with, test_config, test_session_data, ScriptedCallbacks,
    };
    use super::*;
    use crate::backend::{FaultKind, MemoryFs};
    use crate::config::SessionData;
    use chrono::Utc;

    #[tokio::test]
    async fn test_read_directory_uses_cache_when_forced() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"a", Utc::now());
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let reads = fs.lock().read_directory_count;

        session.read_directory(false, false).await.unwrap();
        assert_eq!(fs.lock().read_directory_count, reads);
        session.read_directory(true, false).await.unwrap();
        assert_eq!(fs.lock().read_directory_count, reads + 1);
    }

    #[tokio::test]
    async fn test_cached_directory_change() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_directory("/srv/www");
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();

        session.change_directory("/srv/www").await.unwrap();
        session.change_directory("/home/user").await.unwrap();
        session.change_directory("/srv/www").await.unwrap();
        assert_eq!(session.peek_current_directory(), "/srv/www");
        let cache = session.directory_changes_cache.as_ref().unwrap();
        assert_eq!(
            cache.get_directory_change("/home/user", "/srv/www").as_deref(),
            Some("/srv/www")
        );
    }

    #[tokio::test]
    async fn test_change_directory_failure_is_reported() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        session.change_directory("/missing").await.unwrap();
        assert_eq!(ui.extended_exceptions().len(), 1);
        assert_eq!(session.peek_current_directory(), "/home/user");

        session.set_exception_on_fail(true);
        assert!(matches!(
            session.change_directory("/missing").await,
            Err(SessionError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_file_exists() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"a", Utc::now());
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        assert!(session.file_exists("a.txt").await.unwrap());
        assert!(!session.file_exists("b.txt").await.unwrap());
        assert!(ui.extended_exceptions().is_empty());
    }

    #[tokio::test]
    async fn test_process_directory_ignores_errors() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/data/x", b"x", Utc::now());
        fs.lock().add_file("/data/sub/y", b"y", Utc::now());
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let entries = session.process_directory("/data", false, false).await.unwrap();
        let mut names: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["/data/sub", "/data/x"]);

        fs.lock().inject_fault("read_directory", Some("/data"), FaultKind::Operation, 1);
        let entries = session.process_directory("/data", false, true).await.unwrap();
        assert!(entries.is_empty());
        assert!(ui.queries().is_empty());
    }

    #[tokio::test]
    async fn test_listing_retry_then_success() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/data/x.txt", b"x", Utc::now());
        fs.lock().add_file("/data/y.log", b"y", Utc::now());
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::RETRY]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        fs.lock().inject_fault("read_directory", Some("/data"), FaultKind::Operation, 1);
        let mask = FileMask::parse("*.txt").unwrap();
        let list = session.read_directory_listing("/data", &mask).await.unwrap();
        assert_eq!(list.count(), 1);
        assert_eq!(ui.queries().len(), 1);
        let action = session.action_log().entries().last().unwrap();
        assert_eq!(action.kind, ActionKind::Ls);
        assert_eq!(action.output, vec!["x.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_file_modified_invalidates_parent_and_directory() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/d/x", b"x", Utc::now());
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        session.do_read_directory_listing("/home/user/d", true).await.unwrap();
        assert!(session.directory_cache().has_file_list("/home/user/d"));
        assert!(session.directory_cache().has_file_list("/home/user"));

        let dir = session.files().find_file("d").cloned().unwrap();
        session.file_modified(Some(&dir), "", true);
        assert!(!session.directory_cache().has_file_list("/home/user/d"));
        assert!(!session.directory_cache().has_file_list("/home/user"));
    }

    #[tokio::test]
    async fn test_lock_in_home_translation() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_directory("/home/user/sub");
        let data = SessionData {
            lock_in_home: true,
            ..test_session_data()
        };
        let mut session = memory_session_with(&fs, ScriptedCallbacks::new(), data, test_config());
        session.open().await.unwrap();
        assert_eq!(session.current_directory().await.unwrap(), "/");

        session.set_current_directory("/sub").await.unwrap();
        assert_eq!(session.peek_current_directory(), "/sub");
        assert_eq!(session.translate_locked_path("/sub", false), "/home/user/sub");
    }

    #[tokio::test]
    async fn test_directory_file_list() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/data/x", b"x", Utc::now());
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();

        let current = session.directory_file_list("/home/user", None, false).await.unwrap();
        assert!(current.is_some());
        let stamp = current.unwrap().timestamp();
        assert!(session
            .directory_file_list("/home/user", Some(stamp), false)
            .await
            .unwrap()
            .is_none());

        assert!(session.directory_file_list("/data", None, false).await.unwrap().is_none());
        let loaded = session.directory_file_list("/data", None, true).await.unwrap().unwrap();
        assert!(loaded.find_file("x").is_some());
    }
}
