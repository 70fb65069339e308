//! Batch engine and remote file operations
//!
//! [`Session::process_files`] runs one [`FileProcessor`] over a list of files
//! under a single progress and transaction. A file the user chose to skip does
//! not stop the batch; any other error does.

use std::path::Path;

use async_trait::async_trait;
use chrono::Local;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ActionId, ActionKind, FileOperation, FsCommand, OnceDoneOperation, OperationProgress,
    OperationSide, QueryAnswers, QueryParams, Session, SessionError,
};
use crate::backend::{
    expand_command_patterns, is_file_list_command, shell_quote, BackendError, Capability,
    RemoteFile, RemoteProperties, SpaceAvailable,
};
use crate::config::CopyParams;
use crate::path_utils::{
    mask_file_name, unix_exclude_trailing_slash, unix_extract_file_dir, unix_extract_file_name,
    unix_include_trailing_slash, unix_is_child_path, unix_parent_directory, unix_same_path,
};

/// One entry of a batch: a path and, when known, its listing entry
#[derive(Debug, Clone)]
pub struct FileListItem {
    pub name: String,
    pub file: Option<RemoteFile>,
}

impl FileListItem {
    pub fn path(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
        }
    }

    pub fn remote(file: RemoteFile) -> Self {
        Self {
            name: file.full_path(),
            file: Some(file),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    /// Delete for good even when a recycle bin is configured
    pub force_delete: bool,
    /// Invert the session's recycle bin preference
    pub alternative: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CalculateSizeParams {
    /// Directories that cannot be listed count as empty
    pub ignore_errors: bool,
    /// Count only what these parameters would transfer
    pub copy_params: Option<CopyParams>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CalculateSizeStats {
    pub size: u64,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCommandParams {
    /// Pass directories to file list commands too
    pub apply_to_directories: bool,
}

/// Work done on each file of a batch
#[async_trait]
pub(crate) trait FileProcessor: Send {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError>;
}

struct DeleteProcessor(DeleteParams);

#[async_trait]
impl FileProcessor for DeleteProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        session.delete_file(file_name, file, self.0).await
    }
}

struct LocalDeleteProcessor;

#[async_trait]
impl FileProcessor for LocalDeleteProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        session.delete_local_file(file_name).await
    }
}

struct MoveProcessor {
    target: String,
    mask: String,
    copy: bool,
}

#[async_trait]
impl FileProcessor for MoveProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        if self.copy {
            session.copy_file(file_name, &self.target, &self.mask).await
        } else {
            session.move_file(file_name, file, &self.target, &self.mask).await
        }
    }
}

struct PropertiesProcessor(RemoteProperties);

#[async_trait]
impl FileProcessor for PropertiesProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        session.change_file_properties(file_name, file, &self.0).await
    }
}

struct SizeProcessor {
    params: CalculateSizeParams,
    stats: CalculateSizeStats,
}

#[async_trait]
impl FileProcessor for SizeProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        let file = match file {
            Some(file) => file.clone(),
            None => match session.read_file(file_name).await? {
                Some(file) => file,
                None => return Ok(()),
            },
        };
        session
            .calculate_file_size(file_name, &file, &self.params, &mut self.stats)
            .await
    }
}

struct CustomCommandProcessor {
    command: String,
    output: Vec<String>,
}

#[async_trait]
impl FileProcessor for CustomCommandProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        let lines = session
            .custom_command_on_file(file_name, file, &self.command)
            .await?;
        self.output.extend(lines);
        Ok(())
    }
}

/// Name of a batch entry, falling back to the listing entry
fn entry_name(file_name: &str, file: Option<&RemoteFile>) -> String {
    match file {
        Some(file) if file_name.is_empty() => file.full_path(),
        _ => file_name.to_string(),
    }
}

fn remove_local(path: &Path) -> std::io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

impl Session {
    /// Run `processor` over `files`; `Ok(false)` when the batch was cancelled
    pub(crate) async fn process_files(
        &mut self,
        files: &[FileListItem],
        operation: FileOperation,
        processor: &mut (dyn FileProcessor + '_),
        side: OperationSide,
    ) -> Result<bool, SessionError> {
        let outer = self.progress.replace(OperationProgress::start(
            operation,
            side,
            files.len(),
            false,
        ));
        let remote = side == OperationSide::Remote;
        if remote {
            self.begin_transaction();
        }

        let mut once_done = OnceDoneOperation::Idle;
        let mut result = self.process_file_list(files, processor, &mut once_done).await;
        if remote {
            let ended = self.end_transaction().await;
            if result.is_ok() {
                result = ended;
            }
        }

        let completed = self
            .progress
            .as_ref()
            .map(|p| !p.is_cancelled())
            .unwrap_or(false);
        if let Some(progress) = self.progress.as_mut() {
            progress.stop();
        }
        let stopped = self.do_progress().await;
        self.progress = outer;
        result?;
        stopped?;

        if once_done != OnceDoneOperation::Idle {
            return Err(self.close_on_completion(once_done).await);
        }
        Ok(completed)
    }

    pub(super) async fn process_file_list(
        &mut self,
        files: &[FileListItem],
        processor: &mut (dyn FileProcessor + '_),
        once_done: &mut OnceDoneOperation,
    ) -> Result<(), SessionError> {
        for item in files {
            if self.progress.as_ref().map(|p| p.is_cancelled()).unwrap_or(false) {
                break;
            }
            let result = processor.process(self, &item.name, item.file.as_ref()).await;
            if let Some(progress) = self.progress.as_mut() {
                progress.finish();
            }
            let finished = self.do_finished(&item.name, result.is_ok(), once_done).await;
            match result {
                Ok(()) => finished?,
                Err(e) if e.is_skip() => {
                    finished?;
                    self.handle_exception(e)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Skipped files are logged and the batch goes on, unless failures must raise
    pub(crate) fn handle_exception(&mut self, error: SessionError) -> Result<(), SessionError> {
        if self.exception_on_fail() {
            return Err(error);
        }
        warn!("{}", error);
        Ok(())
    }

    /// The finished callback asked to end the session with the operation
    pub(crate) async fn close_on_completion(&mut self, operation: OnceDoneOperation) -> SessionError {
        info!(
            "Closing session after completed operation ({:?}, as requested by user)",
            operation
        );
        if let Err(e) = self.close().await {
            warn!("Error closing session on completion: {}", e);
        }
        SessionError::ClosedOnCompletion
    }

    // ---- delete ----

    pub async fn delete_files(
        &mut self,
        files: &[FileListItem],
        params: DeleteParams,
    ) -> Result<bool, SessionError> {
        let mut processor = DeleteProcessor(params);
        self.process_files(files, FileOperation::Delete, &mut processor, OperationSide::Remote)
            .await
    }

    /// Delete one remote file, or move it to the recycle bin
    pub async fn delete_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        params: DeleteParams,
    ) -> Result<(), SessionError> {
        let name = entry_name(file_name, file);
        self.start_operation_with_file(&name, &[FileOperation::Delete])
            .await?;
        let recycle = !params.force_delete
            && self.data.delete_to_recycle_bin != params.alternative
            && !self.data.recycle_bin_path.is_empty();
        if recycle && !self.is_recycled_file(&name) {
            return self.recycle_file(&name, file).await;
        }

        info!("Deleting file '{}'", name);
        self.file_modified(file, &name, true);
        self.do_delete_file(&name, file).await?;
        self.react_on_command(FsCommand::DeleteFile).await
    }

    pub(super) async fn do_delete_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        let path = self.absolute_path(file_name);
        let action = self.action_log.begin(ActionKind::Delete, &path, None);
        let message = format!("Error deleting file '{}'", file_name);
        let name = file_name.to_string();
        let file = file.cloned();
        self.retry_backend(&message, action, move |b| {
            let name = name.clone();
            let file = file.clone();
            async move { b.delete_file(&name, file.as_ref()).await }.boxed()
        })
        .await
    }

    /// Is the file located in the recycle bin itself
    pub fn is_recycled_file(&mut self, file_name: &str) -> bool {
        if self.data.recycle_bin_path.is_empty() {
            return false;
        }
        let mut path = unix_extract_file_dir(file_name);
        if path.is_empty() {
            path = self.remote_current_directory();
        }
        unix_same_path(&path, &self.data.recycle_bin_path)
    }

    async fn recycle_file(&mut self, file_name: &str, file: Option<&RemoteFile>) -> Result<(), SessionError> {
        let target = self.data.recycle_bin_path.clone();
        info!("Moving file '{}' to remote recycle bin '{}'", file_name, target);
        let mask = format!("*-{}.*", Local::now().format("%Y%m%d-%H%M%S"));
        self.move_file(file_name, file, &target, &mask).await
    }

    /// Delete local files or directory trees
    pub async fn delete_local_files(&mut self, paths: &[String]) -> Result<bool, SessionError> {
        let files: Vec<FileListItem> = paths.iter().map(FileListItem::path).collect();
        let mut processor = LocalDeleteProcessor;
        self.process_files(&files, FileOperation::Delete, &mut processor, OperationSide::Local)
            .await
    }

    pub(crate) async fn delete_local_file(&mut self, path: &str) -> Result<(), SessionError> {
        self.start_operation_with_file(path, &[FileOperation::Delete])
            .await?;
        debug!("Deleting local file '{}'", path);
        let message = format!("Error deleting file '{}'", path);
        let local = Path::new(path).to_path_buf();
        self.file_operation_loop(&message, true, None, |_| remove_local(&local))
            .await
    }

    // ---- rename / move / copy ----

    /// Rename an entry of the current listing, asking before overwriting another.
    ///
    /// Returns `false` when the user declined.
    pub async fn rename_file(
        &mut self,
        file: &RemoteFile,
        new_name: &str,
        check_existence: bool,
    ) -> Result<bool, SessionError> {
        let mut proceed = true;
        let current = self.remote_current_directory();
        if file.name != new_name
            && check_existence
            && self.confirm_overwriting
            && unix_same_path(&current, self.files.directory())
        {
            let duplicate = self.files.find_file(new_name).map(|f| f.is_directory);
            if let Some(is_directory) = duplicate {
                let question = if is_directory {
                    format!("Directory '{}' already exists. Overwrite?", new_name)
                } else {
                    format!("File '{}' already exists. Overwrite?", new_name)
                };
                let params = QueryParams {
                    never_ask_again_check: true,
                    ..Default::default()
                };
                let answer = self
                    .query_user(&question, &[], QueryAnswers::YES | QueryAnswers::NO, &params)
                    .await?;
                if answer == QueryAnswers::NEVER_ASK_AGAIN {
                    self.confirm_overwriting = false;
                } else {
                    proceed = answer == QueryAnswers::YES;
                }
            }
        }

        if proceed {
            self.file_modified(Some(file), &file.name, false);
            self.rename_path(&file.name, new_name).await?;
        }
        Ok(proceed)
    }

    pub async fn rename_path(&mut self, file_name: &str, new_name: &str) -> Result<(), SessionError> {
        info!("Renaming file '{}' to '{}'", file_name, new_name);
        self.do_rename_file(file_name, new_name, false).await?;
        self.react_on_command(FsCommand::RenameFile).await
    }

    async fn do_rename_file(&mut self, file_name: &str, new_name: &str, is_move: bool) -> Result<(), SessionError> {
        let from = self.absolute_path(file_name);
        let to = self.absolute_path(new_name);
        let (kind, message) = if is_move {
            (
                ActionKind::Move,
                format!("Error moving file '{}' to '{}'", file_name, new_name),
            )
        } else {
            (
                ActionKind::Rename,
                format!("Error renaming file '{}' to '{}'", file_name, new_name),
            )
        };
        let action = self.action_log.begin(kind, &from, Some(&to));
        let (source, target) = (file_name.to_string(), new_name.to_string());
        self.retry_backend(&message, action, move |b| {
            let (source, target) = (source.clone(), target.clone());
            async move { b.rename_file(&source, &target).await }.boxed()
        })
        .await
    }

    /// Target path of a move or copy of `file_name` into `target` through `mask`
    fn masked_target(file_name: &str, target: &str, mask: &str) -> String {
        let name = unix_extract_file_name(&unix_exclude_trailing_slash(file_name));
        format!(
            "{}{}",
            unix_include_trailing_slash(target),
            mask_file_name(&name, mask)
        )
    }

    pub async fn move_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        target: &str,
        mask: &str,
    ) -> Result<(), SessionError> {
        self.start_operation_with_file(file_name, &[FileOperation::RemoteMove, FileOperation::Delete])
            .await?;
        let new_name = Self::masked_target(file_name, target, mask);
        info!("Moving file '{}' to '{}'", file_name, new_name);
        self.file_modified(file, file_name, false);
        self.do_rename_file(file_name, &new_name, true).await?;
        self.react_on_command(FsCommand::MoveFile).await
    }

    /// Move files into `target`, renaming them through `mask`
    pub async fn move_files(
        &mut self,
        files: &[FileListItem],
        target: &str,
        mask: &str,
    ) -> Result<bool, SessionError> {
        self.directory_modified(target, true);
        self.begin_transaction();
        let mut processor = MoveProcessor {
            target: target.to_string(),
            mask: mask.to_string(),
            copy: false,
        };
        let result = self
            .process_files(files, FileOperation::RemoteMove, &mut processor, OperationSide::Remote)
            .await;
        let followed = if self.is_active() {
            self.leave_moved_directory(files).await
        } else {
            Ok(())
        };
        let ended = self.end_transaction().await;
        let completed = result?;
        followed?;
        ended?;
        Ok(completed)
    }

    /// When the current directory was moved away, go to its nearest existing ancestor
    async fn leave_moved_directory(&mut self, files: &[FileListItem]) -> Result<(), SessionError> {
        let current = self.working_directory().await?;
        let possibly_moved = files.iter().any(|item| {
            item.file.as_ref().is_some_and(|f| f.is_directory)
                && unix_is_child_path(&item.name, &current)
        });
        if !possibly_moved || self.file_exists(&current).await? {
            return Ok(());
        }

        let mut nearest = current;
        loop {
            nearest = unix_parent_directory(&nearest);
            if nearest == "/" || self.file_exists(&nearest).await? {
                break;
            }
        }
        debug!("Current directory was moved, changing to '{}'", nearest);
        self.change_directory(&nearest).await
    }

    pub async fn copy_file(&mut self, file_name: &str, target: &str, mask: &str) -> Result<(), SessionError> {
        self.start_operation_with_file(file_name, &[FileOperation::RemoteCopy])
            .await?;
        let new_name = Self::masked_target(file_name, target, mask);
        info!("Copying file '{}' to '{}'", file_name, new_name);
        self.do_copy_file(file_name, &new_name).await?;
        self.react_on_command(FsCommand::CopyFile).await
    }

    async fn do_copy_file(&mut self, file_name: &str, new_name: &str) -> Result<(), SessionError> {
        let from = self.absolute_path(file_name);
        let to = self.absolute_path(new_name);
        let action = self.action_log.begin(ActionKind::Copy, &from, Some(&to));
        let message = format!("Error copying file '{}' to '{}'", file_name, new_name);
        self.retry_capable(Capability::RemoteCopy, &message, action, move |b| {
            let (from, to) = (from.clone(), to.clone());
            async move { b.copy_file(&from, &to).await }.boxed()
        })
        .await
    }

    /// Duplicate files into `target`, renaming them through `mask`
    pub async fn copy_files(
        &mut self,
        files: &[FileListItem],
        target: &str,
        mask: &str,
    ) -> Result<bool, SessionError> {
        self.directory_modified(target, true);
        let mut processor = MoveProcessor {
            target: target.to_string(),
            mask: mask.to_string(),
            copy: true,
        };
        self.process_files(files, FileOperation::RemoteCopy, &mut processor, OperationSide::Remote)
            .await
    }

    // ---- create ----

    pub async fn create_directory(
        &mut self,
        dir_name: &str,
        properties: Option<&RemoteProperties>,
    ) -> Result<(), SessionError> {
        self.ensure_non_existence(dir_name)?;
        self.file_modified(None, dir_name, false);

        info!("Creating directory '{}'", dir_name);
        let path = self.absolute_path(dir_name);
        let action = self.action_log.begin(ActionKind::Mkdir, &path, None);
        let message = format!("Error creating directory '{}'", dir_name);
        let name = dir_name.to_string();
        self.retry_backend(&message, action, move |b| {
            let name = name.clone();
            async move { b.create_directory(&name).await }.boxed()
        })
        .await?;

        if let Some(properties) = properties.filter(|p| !p.is_empty()) {
            self.do_change_file_properties(dir_name, None, properties)
                .await?;
        }
        self.react_on_command(FsCommand::CreateDirectory).await
    }

    pub async fn create_link(
        &mut self,
        file_name: &str,
        point_to: &str,
        symbolic: bool,
    ) -> Result<(), SessionError> {
        self.ensure_non_existence(file_name)?;
        if self.data.cache_directories {
            let current = self.remote_current_directory();
            self.directory_modified(&current, false);
        }

        info!(
            "Creating link '{}' to '{}' (symbolic: {})",
            file_name, point_to, symbolic
        );
        let path = self.absolute_path(file_name);
        let action = self.action_log.begin(ActionKind::Link, &path, Some(point_to));
        let message = format!("Error creating link '{}'", file_name);
        let (name, target) = (file_name.to_string(), point_to.to_string());
        self.retry_backend(&message, action, move |b| {
            let (name, target) = (name.clone(), target.clone());
            async move { b.create_link(&name, &target, symbolic).await }.boxed()
        })
        .await?;
        self.react_on_command(FsCommand::CreateDirectory).await
    }

    // ---- properties ----

    pub async fn change_files_properties(
        &mut self,
        files: &[FileListItem],
        properties: &RemoteProperties,
    ) -> Result<bool, SessionError> {
        let mut processor = PropertiesProcessor(properties.clone());
        self.process_files(files, FileOperation::SetProperties, &mut processor, OperationSide::Remote)
            .await
    }

    pub async fn change_file_properties(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), SessionError> {
        let name = entry_name(file_name, file);
        self.start_operation_with_file(&name, &[FileOperation::SetProperties])
            .await?;
        info!(
            "Changing properties of '{}' (recursive: {})",
            name, properties.recursive
        );
        if let Some(modes) = properties.modes {
            debug!(" - mode: {:o}", modes);
        }
        if let Some(group) = properties.group.as_ref() {
            debug!(" - group: {}", group.display_text());
        }
        if let Some(owner) = properties.owner.as_ref() {
            debug!(" - owner: {}", owner.display_text());
        }
        if let Some(modification) = properties.modification {
            debug!(" - modification: {}", modification.format("%d.%m.%Y %H:%M:%S"));
        }
        if let Some(last_access) = properties.last_access {
            debug!(" - last access: {}", last_access.format("%d.%m.%Y %H:%M:%S"));
        }

        self.file_modified(file, &name, false);
        self.do_change_file_properties(&name, file, properties).await?;
        self.react_on_command(FsCommand::ChangeProperties).await
    }

    pub(crate) async fn do_change_file_properties(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), SessionError> {
        let path = self.absolute_path(file_name);
        let action = self.action_log.begin(ActionKind::Chmod, &path, None);
        let message = format!("Error changing properties of file '{}'", file_name);
        let (name, file, properties) = (file_name.to_string(), file.cloned(), properties.clone());
        self.retry_backend(&message, action, move |b| {
            let (name, file, properties) = (name.clone(), file.clone(), properties.clone());
            async move {
                b.change_file_properties(&name, file.as_ref(), &properties)
                    .await
            }
            .boxed()
        })
        .await
    }

    // ---- size ----

    /// Total size of files and directory trees
    pub async fn calculate_files_size(
        &mut self,
        files: &[FileListItem],
        params: &CalculateSizeParams,
    ) -> Result<CalculateSizeStats, SessionError> {
        let mut processor = SizeProcessor {
            params: params.clone(),
            stats: CalculateSizeStats::default(),
        };
        self.process_files(files, FileOperation::CalculateSize, &mut processor, OperationSide::Remote)
            .await?;
        Ok(processor.stats)
    }

    async fn calculate_file_size(
        &mut self,
        file_name: &str,
        file: &RemoteFile,
        params: &CalculateSizeParams,
        stats: &mut CalculateSizeStats,
    ) -> Result<(), SessionError> {
        let full_path = file.full_path();
        let allowed = params
            .copy_params
            .as_ref()
            .map(|c| {
                c.allow_transfer(
                    &unix_exclude_trailing_slash(&full_path),
                    OperationSide::Remote,
                    file.is_directory,
                )
            })
            .unwrap_or(true);

        if allowed {
            if file.is_directory {
                if file.is_symlink {
                    stats.size += file.size;
                } else {
                    debug!("Getting size of directory '{}'", file_name);
                    Box::pin(self.calculate_directory_size(&full_path, params, stats)).await?;
                }
                stats.directories += 1;
            } else {
                stats.size += file.size;
                stats.files += 1;
            }
            if file.is_symlink {
                stats.symlinks += 1;
            }
        }

        self.start_operation_with_file(file_name, &[FileOperation::CalculateSize])
            .await
    }

    async fn calculate_directory_size(
        &mut self,
        directory: &str,
        params: &CalculateSizeParams,
        stats: &mut CalculateSizeStats,
    ) -> Result<(), SessionError> {
        let entries = self
            .process_directory(directory, false, params.ignore_errors)
            .await?;
        for (path, file) in entries {
            self.calculate_file_size(&path, &file, params, stats).await?;
        }
        Ok(())
    }

    // ---- commands ----

    /// Run a custom command for each file, or once with the whole list (`!&`)
    pub async fn custom_command_on_files(
        &mut self,
        command: &str,
        params: CustomCommandParams,
        files: &[FileListItem],
    ) -> Result<Vec<String>, SessionError> {
        if !is_file_list_command(command) {
            let mut processor = CustomCommandProcessor {
                command: command.to_string(),
                output: Vec::new(),
            };
            self.process_files(files, FileOperation::CustomCommand, &mut processor, OperationSide::Remote)
                .await?;
            return Ok(processor.output);
        }

        let file_list = files
            .iter()
            .filter(|item| {
                let directory = item
                    .file
                    .as_ref()
                    .is_some_and(|f| f.is_directory && !f.is_symlink);
                !directory || params.apply_to_directories
            })
            .map(|item| shell_quote(&item.name))
            .collect::<Vec<_>>()
            .join(" ");
        let command = expand_command_patterns(command, "", &file_list);
        let current = self.working_directory().await?;
        self.do_any_command(&command, &current, None).await
    }

    pub async fn custom_command_on_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        command: &str,
    ) -> Result<Vec<String>, SessionError> {
        let name = entry_name(file_name, file);
        self.start_operation_with_file(&name, &[FileOperation::CustomCommand])
            .await?;
        info!("Executing custom command '{}' on file '{}'", command, name);
        self.file_modified(file, &name, false);

        let message = format!("Error executing custom command '{}' on file '{}'", command, name);
        let (path, file, text) = (name.clone(), file.cloned(), command.to_string());
        let lines = self
            .retry_capable(Capability::AnyCommand, &message, None, move |b| {
                let (path, file, text) = (path.clone(), file.clone(), text.clone());
                async move { b.custom_command_on_file(&path, file.as_ref(), &text).await }.boxed()
            })
            .await?;
        self.react_on_command(FsCommand::AnyCommand).await?;
        Ok(lines)
    }

    /// Run an arbitrary command in the current directory, returning its output.
    ///
    /// A failure is shown to the user and yields no output, unless failures must
    /// raise or the connection is gone.
    pub async fn any_command(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        let current = self.working_directory().await?;
        let action = self.action_log.begin(ActionKind::Call, &current, Some(command));
        self.do_any_command(command, &current, action).await
    }

    async fn do_any_command(
        &mut self,
        command: &str,
        current: &str,
        action: Option<ActionId>,
    ) -> Result<Vec<String>, SessionError> {
        match self.run_any_command(command, current).await {
            Ok(lines) => {
                self.action_log.add_output(action, &lines);
                self.action_log.commit(action);
                Ok(lines)
            }
            Err(e) => {
                self.action_log.rollback(action, Some(&e.to_string()));
                if e.is_fatal() {
                    return Err(self.fatal_error(e, "").await);
                }
                if self.exception_on_fail() || e.is_abort() {
                    return Err(e);
                }
                self.handle_extended_exception(&e).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn run_any_command(&mut self, command: &str, current: &str) -> Result<Vec<String>, SessionError> {
        self.directory_modified(current, false);
        let lines = if self.is_capable(Capability::AnyCommand) {
            debug!("Executing user defined command");
            self.backend_mut()?.any_command(command).await?
        } else {
            debug!("Executing user defined command on command session");
            let text = command.to_string();
            let lines = self
                .on_command_session(&mut move |b| {
                    let text = text.clone();
                    async move { b.any_command(&text).await }.boxed()
                })
                .await?;
            // the command may have moved the shell elsewhere
            let directory = self.command_session_directory().await?;
            if !directory.is_empty() && directory != current {
                self.change_directory(&directory).await?;
            }
            lines
        };
        self.react_on_command(FsCommand::AnyCommand).await?;
        Ok(lines)
    }

    /// Free space on the file system holding `path`; `None` when the failure was reported
    pub async fn space_available(&mut self, path: &str) -> Result<Option<SpaceAvailable>, SessionError> {
        if !self.is_capable(Capability::CheckingSpaceAvailable) {
            return Err(SessionError::Backend(BackendError::NotSupported(
                "space available".to_string(),
            )));
        }
        let result = async { Ok::<_, SessionError>(self.backend_mut()?.space_available(path).await?) }.await;
        match result {
            Ok(space) => Ok(Some(space)),
            Err(e) => {
                let message = format!("Error checking space available for path '{}'", path);
                self.command_error(e, &message, QueryAnswers::NONE).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{
        limited_memory_session, memory_session, memory_session_with, test_config,
        test_session_data, ScriptedCallbacks,
    };
    use super::*;
    use crate::backend::{FaultKind, MemoryFs};
    use crate::config::{FileMask, SessionData};
    use crate::session::{ActionState, SessionStatus};
    use chrono::Utc;

    fn paths(names: &[&str]) -> Vec<FileListItem> {
        names.iter().map(|n| FileListItem::path(*n)).collect()
    }

    fn three_files() -> std::sync::Arc<parking_lot::Mutex<MemoryFs>> {
        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/a.txt", b"a", Utc::now());
            fs.add_file("/home/user/b.txt", b"bb", Utc::now());
            fs.add_file("/home/user/c.txt", b"ccc", Utc::now());
        }
        fs
    }

    #[tokio::test]
    async fn test_delete_files_skips_failed_file() {
        let fs = three_files();
        fs.lock()
            .inject_fault("delete_file", Some("/home/user/b.txt"), FaultKind::Operation, 1);
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::SKIP]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let files = paths(&["/home/user/a.txt", "/home/user/b.txt", "/home/user/c.txt"]);
        let completed = session
            .delete_files(&files, DeleteParams::default())
            .await
            .unwrap();

        assert!(completed);
        assert!(!fs.lock().exists("/home/user/a.txt"));
        assert!(fs.lock().exists("/home/user/b.txt"));
        assert!(!fs.lock().exists("/home/user/c.txt"));
        assert_eq!(
            ui.finished(),
            vec![
                ("/home/user/a.txt".to_string(), true),
                ("/home/user/b.txt".to_string(), false),
                ("/home/user/c.txt".to_string(), true),
            ]
        );
        let states: Vec<ActionState> = session.action_log().entries().iter().map(|a| a.state).collect();
        assert_eq!(
            states,
            vec![ActionState::Committed, ActionState::Cancelled, ActionState::Committed]
        );
        assert!(session.progress().is_none());
        assert_eq!(session.transaction_depth(), 0);
        // the listing was refreshed once, at the end of the batch
        assert!(session.files().find_file("b.txt").is_some());
        assert!(session.files().find_file("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_mid_batch_stops_progress_once() {
        let fs = three_files();
        fs.lock()
            .inject_fault("delete_file", Some("/home/user/b.txt"), FaultKind::ConnectionLost, 1);
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let files = paths(&["/home/user/a.txt", "/home/user/b.txt", "/home/user/c.txt"]);
        let err = session
            .delete_files(&files, DeleteParams::default())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(fs.lock().exists("/home/user/c.txt"));
        assert_eq!(ui.progress_stops(), 1);
        assert_eq!(ui.closed_count(), 1);
        assert_eq!(session.transaction_depth(), 0);
    }

    #[tokio::test]
    async fn test_abort_answer_stops_batch() {
        let fs = three_files();
        fs.lock()
            .inject_fault("delete_file", Some("/home/user/a.txt"), FaultKind::Operation, 1);
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::ABORT]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let files = paths(&["/home/user/a.txt", "/home/user/b.txt"]);
        let err = session
            .delete_files(&files, DeleteParams::default())
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert!(fs.lock().exists("/home/user/b.txt"));
        assert!(session.is_active());
        assert_eq!(
            session.action_log().entries()[0].state,
            ActionState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_once_done_closes_session() {
        let fs = three_files();
        let ui = ScriptedCallbacks::new();
        ui.set_once_done(OnceDoneOperation::Disconnect);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let err = session
            .delete_files(&paths(&["a.txt"]), DeleteParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ClosedOnCompletion));
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(!fs.lock().exists("/home/user/a.txt"));
    }

    #[tokio::test]
    async fn test_delete_moves_to_recycle_bin() {
        let fs = three_files();
        fs.lock().add_directory("/home/user/.trash");
        let data = SessionData {
            recycle_bin_path: "/home/user/.trash".to_string(),
            delete_to_recycle_bin: true,
            ..test_session_data()
        };
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session_with(&fs, ui, data, test_config());
        session.open().await.unwrap();

        session
            .delete_files(&paths(&["/home/user/a.txt"]), DeleteParams::default())
            .await
            .unwrap();
        assert!(!fs.lock().exists("/home/user/a.txt"));
        let trash = session
            .read_directory_listing("/home/user/.trash", &FileMask::default())
            .await
            .unwrap();
        assert_eq!(trash.count(), 1);
        let recycled = trash.files()[0].name.clone();
        assert!(recycled.starts_with("a-") && recycled.ends_with(".txt"));
        assert!(session.is_recycled_file(&format!("/home/user/.trash/{}", recycled)));

        // the alternative delete bypasses the bin
        let alternative = DeleteParams {
            alternative: true,
            ..Default::default()
        };
        session
            .delete_files(&paths(&["/home/user/b.txt"]), alternative)
            .await
            .unwrap();
        assert!(!fs.lock().exists("/home/user/b.txt"));
        assert_eq!(
            session
                .read_directory_listing("/home/user/.trash", &FileMask::default())
                .await
                .unwrap()
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rename_asks_before_overwriting() {
        let fs = three_files();
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::NO, QueryAnswers::NEVER_ASK_AGAIN]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let a = session.files().find_file("a.txt").cloned().unwrap();
        assert!(!session.rename_file(&a, "b.txt", true).await.unwrap());
        assert!(fs.lock().exists("/home/user/a.txt"));

        assert!(session.rename_file(&a, "b.txt", true).await.unwrap());
        assert!(!fs.lock().exists("/home/user/a.txt"));
        assert_eq!(fs.lock().content("/home/user/b.txt").unwrap(), b"a".to_vec());
        assert!(!session.confirm_overwriting());
        assert_eq!(ui.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_move_current_directory_walks_up() {
        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_directory("/home/user/src/sub");
            fs.add_directory("/home/user/dst");
        }
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui);
        session.open().await.unwrap();
        let src = session.files().find_file("src").cloned().unwrap();
        session.change_directory("/home/user/src/sub").await.unwrap();

        let completed = session
            .move_files(&[FileListItem::remote(src)], "/home/user/dst", "")
            .await
            .unwrap();
        assert!(completed);
        assert!(fs.lock().is_directory("/home/user/dst/src/sub"));
        assert_eq!(session.current_directory().await.unwrap(), "/home/user");
        assert!(session.files().find_file("dst").is_some());
    }

    #[tokio::test]
    async fn test_copy_files_uses_command_session_without_remote_copy() {
        let fs = three_files();
        fs.lock().add_directory("/home/user/backup");
        let ui = ScriptedCallbacks::new();
        let mut session = limited_memory_session(&fs, ui, vec![]);
        session.open().await.unwrap();

        let completed = session
            .copy_files(&paths(&["/home/user/a.txt"]), "/home/user/backup", "*.bak")
            .await
            .unwrap();
        assert!(completed);
        assert!(fs.lock().exists("/home/user/backup/a.bak"));
        assert!(fs.lock().exists("/home/user/a.txt"));
        assert!(session.command_session_opened());
    }

    #[tokio::test]
    async fn test_create_directory_and_link() {
        let fs = three_files();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let properties = RemoteProperties {
            modes: Some(0o700),
            ..Default::default()
        };
        session
            .create_directory("private", Some(&properties))
            .await
            .unwrap();
        assert!(fs.lock().is_directory("/home/user/private"));
        assert_eq!(fs.lock().permissions("/home/user/private"), Some(0o700));
        assert!(session.files().find_file("private").is_some());

        let err = session.create_directory("private", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Command(_)));

        session.create_link("link", "a.txt", true).await.unwrap();
        let link = session.files().find_file("link").cloned().unwrap();
        assert!(link.is_symlink);
        assert_eq!(link.link_target.as_deref(), Some("a.txt"));
    }

    #[tokio::test]
    async fn test_change_files_properties() {
        let fs = three_files();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let properties = RemoteProperties {
            modes: Some(0o600),
            ..Default::default()
        };
        let completed = session
            .change_files_properties(&paths(&["a.txt", "b.txt"]), &properties)
            .await
            .unwrap();
        assert!(completed);
        assert_eq!(fs.lock().permissions("/home/user/a.txt"), Some(0o600));
        assert_eq!(fs.lock().permissions("/home/user/b.txt"), Some(0o600));
        assert_eq!(fs.lock().permissions("/home/user/c.txt"), Some(0o644));
    }

    #[tokio::test]
    async fn test_calculate_files_size() {
        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/d/x", &[0; 10], Utc::now());
            fs.add_file("/home/user/d/e/y", &[0; 5], Utc::now());
            fs.add_file("/home/user/z", &[0; 3], Utc::now());
        }
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let items: Vec<FileListItem> = ["d", "z"]
            .iter()
            .map(|n| FileListItem::remote(session.files().find_file(n).cloned().unwrap()))
            .collect();

        let stats = session
            .calculate_files_size(&items, &CalculateSizeParams::default())
            .await
            .unwrap();
        assert_eq!(
            stats,
            CalculateSizeStats {
                size: 18,
                files: 3,
                directories: 2,
                symlinks: 0,
            }
        );

        fs.lock()
            .inject_fault("read_directory", Some("/home/user/d/e"), FaultKind::Operation, 1);
        let params = CalculateSizeParams {
            ignore_errors: true,
            ..Default::default()
        };
        let stats = session.calculate_files_size(&items, &params).await.unwrap();
        assert_eq!(stats.size, 13);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 2);
    }

    #[tokio::test]
    async fn test_custom_commands() {
        let fs = three_files();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let files = paths(&["/home/user/a.txt", "/home/user/b.txt"]);

        session
            .custom_command_on_files("tar cf x.tar !&", CustomCommandParams::default(), &files)
            .await
            .unwrap();
        session
            .custom_command_on_files("chmod +x", CustomCommandParams::default(), &files)
            .await
            .unwrap();

        let commands = fs.lock().commands.clone();
        assert_eq!(
            commands,
            vec![
                "tar cf x.tar '/home/user/a.txt' '/home/user/b.txt'".to_string(),
                "chmod +x /home/user/a.txt".to_string(),
                "chmod +x /home/user/b.txt".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_any_command_on_command_session() {
        let fs = three_files();
        let ui = ScriptedCallbacks::new();
        let mut session = limited_memory_session(&fs, ui, vec![]);
        session.open().await.unwrap();

        session.any_command("touch new.txt").await.unwrap();
        assert_eq!(fs.lock().commands, vec!["touch new.txt".to_string()]);
        assert!(session.is_active());
        assert!(session.command_session_opened());
        let call = session.action_log().entries().last().cloned().unwrap();
        assert_eq!(call.kind, ActionKind::Call);
        assert_eq!(call.state, ActionState::Committed);
    }

    #[tokio::test]
    async fn test_any_command_failure_is_shown() {
        let fs = three_files();
        fs.lock().inject_fault("any_command", None, FaultKind::Operation, 1);
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let output = session.any_command("false").await.unwrap();
        assert!(output.is_empty());
        assert_eq!(ui.extended_exceptions().len(), 1);
        assert_eq!(
            session.action_log().entries().last().unwrap().state,
            ActionState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_delete_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.txt");
        let tree = dir.path().join("tree");
        std::fs::write(&file, b"1").unwrap();
        std::fs::create_dir_all(tree.join("inner")).unwrap();
        std::fs::write(tree.join("inner/two.txt"), b"2").unwrap();

        let fs = MemoryFs::new().shared();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        let completed = session
            .delete_local_files(&[
                file.to_string_lossy().to_string(),
                tree.to_string_lossy().to_string(),
            ])
            .await
            .unwrap();
        assert!(completed);
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_space_available() {
        let fs = three_files();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let space = session.space_available("/home/user").await.unwrap().unwrap();
        assert!(space.bytes_available_to_user > 0);
    }
}
