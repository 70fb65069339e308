//! Transfers between the local file system and the remote side
//!
//! Files are written under a `.filepart` name and renamed into place once
//! complete. Directories are walked recursively, honoring the file mask of the
//! copy parameters. Existing targets go through overwrite confirmation.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::operations::{CalculateSizeParams, FileListItem, FileProcessor};
use super::{
    ActionKind, BatchOverwrite, CancelStatus, FileOperation, FsCommand, OnceDoneOperation,
    OperationProgress, OperationSide, QueryAnswers, QueryParams, Session, SessionError,
};
use crate::backend::{
    compare_file_time, BackendError, ModificationPrecision, RemoteFile, RemoteProperties,
    PARTIAL_EXT,
};
use crate::config::CopyParams;
use crate::path_utils::{join_remote_path, unix_exclude_trailing_slash, unix_extract_file_name};

/// Transfer-level switches, on top of [`CopyParams`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParams {
    /// Remove the source after a successful transfer (move)
    pub delete: bool,
    /// Transfer of temporary files the user never sees
    pub temp: bool,
    /// Append to existing targets
    pub append: bool,
    /// Resume partially transferred targets
    pub resume: bool,
}

/// Source and destination details shown when asking to overwrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverwriteFileParams {
    pub source_size: u64,
    pub source_timestamp: DateTime<Utc>,
    pub source_precision: ModificationPrecision,
    pub destination_size: u64,
    pub destination_timestamp: DateTime<Utc>,
    pub destination_precision: ModificationPrecision,
}

impl OverwriteFileParams {
    fn source_newer(&self) -> bool {
        compare_file_time(
            self.source_timestamp,
            self.source_precision,
            self.destination_timestamp,
            self.destination_precision,
        )
        .is_gt()
    }
}

pub(crate) fn modification_of(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_EXT);
    PathBuf::from(name)
}

fn local_entries(directory: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(directory)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Size of local files and trees that `copy_param` lets through
fn local_files_size(files: &[String], copy_param: &CopyParams) -> u64 {
    files
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            copy_param.allow_transfer(&entry.path().to_string_lossy(), OperationSide::Local, false)
        })
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

struct UploadProcessor {
    target_dir: String,
    copy_param: CopyParams,
    params: TransferParams,
}

#[async_trait]
impl FileProcessor for UploadProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        session
            .upload_item(Path::new(file_name), &self.target_dir, &self.copy_param, &self.params, true)
            .await
    }
}

struct DownloadProcessor {
    target_dir: PathBuf,
    copy_param: CopyParams,
    params: TransferParams,
}

#[async_trait]
impl FileProcessor for DownloadProcessor {
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
                None => return Err(SessionError::Skip(format!("File '{}' not found", file_name))),
            },
        };
        session
            .download_item(file_name, &file, &self.target_dir, &self.copy_param, &self.params, true)
            .await
    }
}

impl Session {
    /// Upload local files and directory trees into `target_dir`.
    ///
    /// Returns `false` when the batch was cancelled or failed; a failure that is
    /// not fatal is reported to the user rather than returned.
    pub async fn copy_to_remote(
        &mut self,
        files: &[String],
        target_dir: &str,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<bool, SessionError> {
        info!("Copying {} files/directories to remote directory '{}'", files.len(), target_dir);
        let total_size = copy_param
            .calculate_size
            .then(|| local_files_size(files, copy_param));
        let items: Vec<FileListItem> = files.iter().map(FileListItem::path).collect();
        let mut processor = UploadProcessor {
            target_dir: target_dir.to_string(),
            copy_param: copy_param.clone(),
            params: *params,
        };
        self.directory_modified(target_dir, true);
        self.transfer_files(
            &items,
            params,
            OperationSide::Local,
            total_size,
            &mut processor,
        )
        .await
    }

    /// Download remote files and directory trees into the local `target_dir`
    pub async fn copy_to_local(
        &mut self,
        files: &[FileListItem],
        target_dir: &Path,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<bool, SessionError> {
        info!(
            "Copying {} files/directories to local directory '{}'",
            files.len(),
            target_dir.display()
        );
        let total_size = if copy_param.calculate_size {
            let size_params = CalculateSizeParams {
                ignore_errors: true,
                copy_params: Some(copy_param.clone()),
            };
            Some(self.calculate_files_size(files, &size_params).await?.size)
        } else {
            None
        };
        let mut processor = DownloadProcessor {
            target_dir: target_dir.to_path_buf(),
            copy_param: copy_param.clone(),
            params: *params,
        };
        self.transfer_files(
            files,
            params,
            OperationSide::Remote,
            total_size,
            &mut processor,
        )
        .await
    }

    /// Batch driver of both directions; `side` is the source side
    async fn transfer_files(
        &mut self,
        files: &[FileListItem],
        params: &TransferParams,
        side: OperationSide,
        total_size: Option<u64>,
        processor: &mut (dyn FileProcessor + '_),
    ) -> Result<bool, SessionError> {
        let (command, error_message) = match side {
            OperationSide::Local => (FsCommand::CopyToRemote, "Error copying files to remote side"),
            OperationSide::Remote => (FsCommand::CopyToLocal, "Error copying files to local side"),
        };
        let operation = if params.delete {
            FileOperation::Move
        } else {
            FileOperation::Copy
        };
        let mut progress = OperationProgress::start(operation, side, files.len(), params.temp);
        if let Some(size) = total_size {
            progress.set_total_size(size);
        }
        let outer = self.progress.replace(progress);

        self.begin_transaction();
        let mut once_done = OnceDoneOperation::Idle;
        let mut result = self.process_file_list(files, processor, &mut once_done).await;
        if result.is_ok() && self.is_active() {
            result = self.react_on_command(command).await;
            if result.is_ok() && params.delete && side == OperationSide::Remote {
                result = self.react_on_command(FsCommand::DeleteFile).await;
            }
        }
        let ended = self.end_transaction().await;
        if result.is_ok() {
            result = ended;
        }

        let cancel = self
            .progress
            .as_ref()
            .map(|p| p.cancel)
            .unwrap_or(CancelStatus::Continue);
        let outcome = match result {
            Ok(()) => Ok(cancel == CancelStatus::Continue),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if e.is_abort() => Ok(false),
            Err(e) => {
                once_done = OnceDoneOperation::Idle;
                if cancel == CancelStatus::Cancel {
                    debug!("Transfer cancelled: {}", e);
                    Ok(false)
                } else {
                    self.command_error(e, error_message, QueryAnswers::NONE)
                        .await
                        .map(|_| false)
                }
            }
        };

        if let Some(progress) = self.progress.as_mut() {
            progress.stop();
        }
        let stopped = self.do_progress().await;
        self.progress = outer;
        let completed = outcome?;
        stopped?;

        if once_done != OnceDoneOperation::Idle {
            return Err(self.close_on_completion(once_done).await);
        }
        Ok(completed)
    }

    /// Overwrite mode in force for the next file.
    ///
    /// `special` is set when the source and destination details are known.
    pub fn effective_batch_overwrite(
        &self,
        copy_param: &CopyParams,
        params: &TransferParams,
        special: bool,
    ) -> BatchOverwrite {
        if special && params.resume {
            BatchOverwrite::Resume
        } else if params.append {
            BatchOverwrite::Append
        } else if copy_param.newer_only {
            BatchOverwrite::Older
        } else if copy_param.no_confirmation || !self.confirm_overwriting {
            BatchOverwrite::All
        } else {
            let current = self
                .progress
                .as_ref()
                .map(|p| p.batch_overwrite)
                .unwrap_or(BatchOverwrite::No);
            match current {
                BatchOverwrite::Older | BatchOverwrite::AlternateResume | BatchOverwrite::Resume
                    if !special =>
                {
                    BatchOverwrite::No
                }
                other => other,
            }
        }
    }

    /// Decide about overwriting an existing `file_name`, asking when no batch
    /// mode applies.
    ///
    /// `Yes` overwrites, `No` keeps the destination, `Retry` appends or resumes,
    /// `Skip` picks the alternate resume and `Cancel` stops the batch.
    pub async fn confirm_file_overwrite(
        &mut self,
        file_name: &str,
        file_params: Option<&OverwriteFileParams>,
        answers: QueryAnswers,
        side: OperationSide,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<QueryAnswers, SessionError> {
        let can_alternate_resume =
            file_params.is_some_and(|p| p.destination_size < p.source_size);
        let mut batch = self.effective_batch_overwrite(copy_param, params, true);
        let applicable = match batch {
            BatchOverwrite::Older => file_params.is_some(),
            BatchOverwrite::AlternateResume | BatchOverwrite::Resume => can_alternate_resume,
            _ => true,
        };
        if !applicable {
            batch = self.effective_batch_overwrite(copy_param, params, false);
        }

        let mut result = QueryAnswers::NONE;
        if batch == BatchOverwrite::No {
            let question = match side {
                OperationSide::Local => format!("Local file '{}' already exists. Overwrite?", file_name),
                OperationSide::Remote => format!("Remote file '{}' already exists. Overwrite?", file_name),
            };
            let details: Vec<String> = file_params
                .map(|p| {
                    vec![
                        format!("New: {} bytes, {}", p.source_size, p.source_timestamp.format("%d.%m.%Y %H:%M:%S")),
                        format!(
                            "Existing: {} bytes, {}",
                            p.destination_size,
                            p.destination_timestamp.format("%d.%m.%Y %H:%M:%S")
                        ),
                    ]
                })
                .unwrap_or_default();
            let query_params = QueryParams {
                never_ask_again_check: true,
                ..Default::default()
            };
            result = self
                .query_user(&question, &details, answers, &query_params)
                .await?;
            if result == QueryAnswers::NEVER_ASK_AGAIN {
                self.confirm_overwriting = false;
                result = QueryAnswers::YES;
            } else if result == QueryAnswers::YES_TO_ALL {
                batch = BatchOverwrite::All;
            } else if result == QueryAnswers::ALL {
                batch = BatchOverwrite::Older;
            } else if result == QueryAnswers::NO_TO_ALL {
                batch = BatchOverwrite::None;
            }
            if batch != BatchOverwrite::No {
                if let Some(progress) = self.progress.as_mut() {
                    progress.batch_overwrite = batch;
                }
            }
        }

        Ok(match batch {
            BatchOverwrite::No => result,
            BatchOverwrite::All => QueryAnswers::YES,
            BatchOverwrite::None => QueryAnswers::NO,
            BatchOverwrite::Older => {
                if file_params.is_some_and(|p| p.source_newer()) {
                    QueryAnswers::YES
                } else {
                    QueryAnswers::NO
                }
            }
            BatchOverwrite::AlternateResume => QueryAnswers::SKIP,
            BatchOverwrite::Append | BatchOverwrite::Resume => QueryAnswers::RETRY,
            BatchOverwrite::Alternate => result,
        })
    }

    /// Turn an overwrite decision into go/no-go; `Cancel` stops the batch
    fn overwrite_allowed(&mut self, answer: QueryAnswers, file_name: &str, size: u64) -> Result<bool, SessionError> {
        if answer == QueryAnswers::CANCEL {
            if let Some(progress) = self.progress.as_mut() {
                progress.set_cancel_at_least(CancelStatus::Cancel);
            }
            return Err(SessionError::Abort);
        }
        // append and resume transfer the whole file again
        if answer == QueryAnswers::YES || answer == QueryAnswers::RETRY {
            return Ok(true);
        }
        debug!("Not overwriting '{}'", file_name);
        if let Some(progress) = self.progress.as_mut() {
            progress.add_skipped(size);
        }
        Ok(false)
    }

    // ---- upload ----

    async fn upload_item(
        &mut self,
        local: &Path,
        target_dir: &str,
        copy_param: &CopyParams,
        params: &TransferParams,
        first_level: bool,
    ) -> Result<(), SessionError> {
        let local_name = local.to_string_lossy().to_string();
        self.start_operation_with_file(&local_name, &[FileOperation::Copy, FileOperation::Move])
            .await?;
        let message = format!("Can't get attributes of file '{}'", local_name);
        let path = local.to_path_buf();
        let metadata = self
            .file_operation_loop(&message, true, None, |_| std::fs::metadata(&path))
            .await?;

        let is_directory = metadata.is_dir();
        if !copy_param.allow_transfer(&local_name, OperationSide::Local, is_directory) {
            debug!("File '{}' excluded from transfer", local_name);
            return Ok(());
        }
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_directory && name.ends_with(PARTIAL_EXT) {
            debug!("Skipping partial file '{}'", local_name);
            return Ok(());
        }
        let dest_name = copy_param.change_file_name(&name, OperationSide::Local, first_level);
        let dest = join_remote_path(target_dir, &dest_name);

        if is_directory {
            self.upload_directory(local, &dest, copy_param, params).await
        } else {
            self.upload_file(local, &metadata, &dest, copy_param, params)
                .await
        }
    }

    async fn upload_directory(
        &mut self,
        local: &Path,
        dest: &str,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<(), SessionError> {
        if !self.file_exists(dest).await? {
            info!("Creating remote directory '{}'", dest);
            let path = self.absolute_path(dest);
            let action = self.action_log.begin(ActionKind::Mkdir, &path, None);
            let message = format!("Error creating directory '{}'", dest);
            let name = dest.to_string();
            self.retry_backend(&message, action, move |b| {
                let name = name.clone();
                async move { b.create_directory(&name).await }.boxed()
            })
            .await?;
        }

        let message = format!("Error listing directory '{}'", local.display());
        let path = local.to_path_buf();
        let entries = self
            .file_operation_loop(&message, true, None, |_| local_entries(&path))
            .await?;
        let mut all_done = true;
        for entry in entries {
            match Box::pin(self.upload_item(&entry, dest, copy_param, params, false)).await {
                Ok(()) => {}
                Err(e) if e.is_skip() => {
                    all_done = false;
                    self.handle_exception(e)?;
                }
                Err(e) => return Err(e),
            }
        }

        if params.delete && all_done {
            let message = format!("Error deleting directory '{}'", local.display());
            let path = local.to_path_buf();
            self.file_operation_loop(&message, true, None, |_| std::fs::remove_dir(&path))
                .await?;
        }
        Ok(())
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        metadata: &Metadata,
        dest: &str,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<(), SessionError> {
        let size = metadata.len();
        let modification = modification_of(metadata);
        let dest_name = unix_extract_file_name(dest);

        let existing = self.stat_file(dest).await?;
        let replace = existing.is_some();
        if let Some(existing) = existing {
            if existing.is_directory {
                return Err(SessionError::Skip(format!(
                    "Cannot overwrite remote directory '{}' with a file",
                    dest
                )));
            }
            if self.effective_batch_overwrite(copy_param, params, true) != BatchOverwrite::All {
                let file_params = OverwriteFileParams {
                    source_size: size,
                    source_timestamp: modification,
                    source_precision: ModificationPrecision::Full,
                    destination_size: existing.size,
                    destination_timestamp: existing.modification,
                    destination_precision: existing.modification_precision,
                };
                let answers = QueryAnswers::YES
                    | QueryAnswers::NO
                    | QueryAnswers::CANCEL
                    | QueryAnswers::YES_TO_ALL
                    | QueryAnswers::NO_TO_ALL
                    | QueryAnswers::ALL;
                let answer = self
                    .confirm_file_overwrite(
                        &dest_name,
                        Some(&file_params),
                        answers,
                        OperationSide::Remote,
                        copy_param,
                        params,
                    )
                    .await?;
                if !self.overwrite_allowed(answer, &dest_name, size)? {
                    return Ok(());
                }
            }
        }

        info!("Copying '{}' to remote '{}'", local.display(), dest);
        self.file_modified(None, dest, false);
        let path = self.absolute_path(dest);
        let local_text = local.to_string_lossy().to_string();
        let action = self
            .action_log
            .begin(ActionKind::Upload, &path, Some(&local_text));
        let message = format!("Copying file '{}' failed", local.display());
        let source = local.to_path_buf();
        let target = dest.to_string();
        let partial = format!("{}{}", dest, PARTIAL_EXT);
        let preserve_time = copy_param.preserve_time;
        let written = self
            .retry_backend(&message, action, move |b| {
                let (source, target, partial) = (source.clone(), target.clone(), partial.clone());
                async move {
                    let written = b.upload_file(&source, &partial, preserve_time).await?;
                    if replace {
                        // gone already when a retry follows a failed rename
                        match b.delete_file(&target, None).await {
                            Ok(()) | Err(BackendError::FileNotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    b.rename_file(&partial, &target).await?;
                    Ok(written)
                }
                .boxed()
            })
            .await?;

        if let Some(modes) = copy_param.rights {
            let properties = RemoteProperties {
                modes: Some(modes),
                ..Default::default()
            };
            self.do_change_file_properties(dest, None, &properties)
                .await?;
        }
        if let Some(progress) = self.progress.as_mut() {
            progress.add_transferred(written);
        }

        if params.delete {
            let message = format!("Error deleting file '{}'", local.display());
            let path = local.to_path_buf();
            self.file_operation_loop(&message, true, None, |_| std::fs::remove_file(&path))
                .await?;
        }
        Ok(())
    }

    // ---- download ----

    async fn download_item(
        &mut self,
        file_name: &str,
        file: &RemoteFile,
        target_dir: &Path,
        copy_param: &CopyParams,
        params: &TransferParams,
        first_level: bool,
    ) -> Result<(), SessionError> {
        let full_path = if file_name.is_empty() {
            file.full_path()
        } else {
            file_name.to_string()
        };
        self.start_operation_with_file(&full_path, &[FileOperation::Copy, FileOperation::Move])
            .await?;
        if !copy_param.allow_transfer(&full_path, OperationSide::Remote, file.is_directory) {
            debug!("File '{}' excluded from transfer", full_path);
            return Ok(());
        }
        if !file.is_directory && file.name.ends_with(PARTIAL_EXT) {
            debug!("Skipping partial file '{}'", full_path);
            return Ok(());
        }
        let name = unix_extract_file_name(&unix_exclude_trailing_slash(&full_path));
        let dest = target_dir.join(copy_param.change_file_name(&name, OperationSide::Remote, first_level));

        if file.is_directory {
            self.download_directory(&full_path, file, &dest, copy_param, params)
                .await
        } else {
            self.download_file(&full_path, file, &dest, copy_param, params)
                .await
        }
    }

    async fn download_directory(
        &mut self,
        full_path: &str,
        file: &RemoteFile,
        dest: &Path,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<(), SessionError> {
        let message = format!("Can't create directory '{}'", dest.display());
        let path = dest.to_path_buf();
        self.file_operation_loop(&message, true, None, |_| std::fs::create_dir_all(&path))
            .await?;

        let entries = self.process_directory(full_path, false, false).await?;
        let mut all_done = true;
        for (child_path, child) in entries {
            match Box::pin(self.download_item(&child_path, &child, dest, copy_param, params, false)).await {
                Ok(()) => {}
                Err(e) if e.is_skip() => {
                    all_done = false;
                    self.handle_exception(e)?;
                }
                Err(e) => return Err(e),
            }
        }

        if params.delete && all_done {
            self.file_modified(Some(file), full_path, true);
            self.do_delete_file(full_path, Some(file)).await?;
        }
        Ok(())
    }

    async fn download_file(
        &mut self,
        full_path: &str,
        file: &RemoteFile,
        dest: &Path,
        copy_param: &CopyParams,
        params: &TransferParams,
    ) -> Result<(), SessionError> {
        if let Ok(existing) = std::fs::metadata(dest) {
            if existing.is_dir() {
                return Err(SessionError::Skip(format!(
                    "Cannot overwrite local directory '{}' with a file",
                    dest.display()
                )));
            }
            let file_params = OverwriteFileParams {
                source_size: file.size,
                source_timestamp: file.modification,
                source_precision: file.modification_precision,
                destination_size: existing.len(),
                destination_timestamp: modification_of(&existing),
                destination_precision: ModificationPrecision::Full,
            };
            let answers = QueryAnswers::YES
                | QueryAnswers::NO
                | QueryAnswers::CANCEL
                | QueryAnswers::YES_TO_ALL
                | QueryAnswers::NO_TO_ALL
                | QueryAnswers::ALL;
            let dest_name = dest.to_string_lossy().to_string();
            let answer = self
                .confirm_file_overwrite(
                    &dest_name,
                    Some(&file_params),
                    answers,
                    OperationSide::Local,
                    copy_param,
                    params,
                )
                .await?;
            if !self.overwrite_allowed(answer, &dest_name, file.size)? {
                return Ok(());
            }
        }

        info!("Copying '{}' to local '{}'", full_path, dest.display());
        let partial = partial_path(dest);
        let path = self.absolute_path(full_path);
        let local_text = dest.to_string_lossy().to_string();
        let action = self
            .action_log
            .begin(ActionKind::Download, &path, Some(&local_text));
        let message = format!("Copying file '{}' failed", full_path);
        let (source, target) = (full_path.to_string(), partial.clone());
        let read = self
            .retry_backend(&message, action, move |b| {
                let (source, target) = (source.clone(), target.clone());
                async move { b.download_file(&source, &target).await }.boxed()
            })
            .await?;

        let message = format!("Can't rename file '{}'", partial.display());
        let target = dest.to_path_buf();
        self.file_operation_loop(&message, true, None, |_| std::fs::rename(&partial, &target))
            .await?;
        if copy_param.preserve_time {
            self.set_local_file_time(dest, file.modification).await?;
        }
        if let Some(progress) = self.progress.as_mut() {
            progress.add_transferred(read);
        }

        if params.delete {
            self.file_modified(Some(file), full_path, false);
            self.do_delete_file(full_path, Some(file)).await?;
        }
        Ok(())
    }

    /// Set the modification time of a local file
    pub(crate) async fn set_local_file_time(
        &mut self,
        path: &Path,
        modification: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        debug!("Setting timestamp of local file '{}'", path.display());
        let message = format!("Can't set timestamp of file '{}'", path.display());
        let time = SystemTime::from(modification);
        let target = path.to_path_buf();
        self.file_operation_loop(&message, true, None, |_| {
            std::fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(time)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{memory_session, ScriptedCallbacks};
    use super::*;
    use crate::backend::{FaultKind, MemoryFs};
    use crate::session::ActionState;
    use chrono::{Duration, TimeZone};

    fn set_mtime(path: &Path, time: DateTime<Utc>) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::from(time))
            .unwrap();
    }

    fn local_path(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_effective_batch_overwrite() {
        let fs = MemoryFs::new().shared();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        let copy = CopyParams::default();
        let params = TransferParams::default();
        assert_eq!(session.effective_batch_overwrite(&copy, &params, true), BatchOverwrite::No);

        let resume = TransferParams {
            resume: true,
            ..Default::default()
        };
        assert_eq!(session.effective_batch_overwrite(&copy, &resume, true), BatchOverwrite::Resume);
        assert_eq!(session.effective_batch_overwrite(&copy, &resume, false), BatchOverwrite::No);

        let newer = CopyParams {
            newer_only: true,
            ..Default::default()
        };
        assert_eq!(session.effective_batch_overwrite(&newer, &params, false), BatchOverwrite::Older);

        let mut progress = OperationProgress::start(FileOperation::Copy, OperationSide::Local, 1, false);
        progress.batch_overwrite = BatchOverwrite::Older;
        session.progress = Some(progress);
        assert_eq!(session.effective_batch_overwrite(&copy, &params, true), BatchOverwrite::Older);
        assert_eq!(session.effective_batch_overwrite(&copy, &params, false), BatchOverwrite::No);

        session.confirm_overwriting = false;
        assert_eq!(session.effective_batch_overwrite(&copy, &params, false), BatchOverwrite::All);
    }

    #[tokio::test]
    async fn test_upload_tree_with_mask() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site");
        std::fs::create_dir_all(root.join("css")).unwrap();
        std::fs::write(root.join("index.html"), b"<html>").unwrap();
        std::fs::write(root.join("debug.log"), b"noise").unwrap();
        std::fs::write(root.join("css/main.css"), b"body{}").unwrap();
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        set_mtime(&root.join("index.html"), stamp);

        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let copy = CopyParams::default().with_mask("| *.log");
        let completed = session
            .copy_to_remote(&[local_path(&root)], "/home/user", &copy, &TransferParams::default())
            .await
            .unwrap();

        assert!(completed);
        let fs = fs.lock();
        assert_eq!(fs.content("/home/user/site/index.html").unwrap(), b"<html>".to_vec());
        assert_eq!(fs.content("/home/user/site/css/main.css").unwrap(), b"body{}".to_vec());
        assert!(!fs.exists("/home/user/site/debug.log"));
        assert!(!fs.exists("/home/user/site/index.html.filepart"));
        assert_eq!(fs.modification("/home/user/site/index.html"), Some(stamp));
        assert_eq!(ui.finished(), vec![(local_path(&root), true)]);
        assert!(session.files().find_file("site").is_some());
    }

    #[tokio::test]
    async fn test_upload_asks_before_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let c = dir.path().join("c.txt");
        for path in [&a, &b, &c] {
            std::fs::write(path, b"new").unwrap();
        }

        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/a.txt", b"old", Utc::now());
            fs.add_file("/home/user/b.txt", b"old", Utc::now());
            fs.add_file("/home/user/c.txt", b"old", Utc::now());
        }
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::NO, QueryAnswers::YES_TO_ALL]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let files = [local_path(&a), local_path(&b), local_path(&c)];
        let completed = session
            .copy_to_remote(&files, "/home/user", &CopyParams::default(), &TransferParams::default())
            .await
            .unwrap();

        assert!(completed);
        assert_eq!(fs.lock().content("/home/user/a.txt").unwrap(), b"old".to_vec());
        assert_eq!(fs.lock().content("/home/user/b.txt").unwrap(), b"new".to_vec());
        assert_eq!(fs.lock().content("/home/user/c.txt").unwrap(), b"new".to_vec());
        // yes-to-all answered for the rest of the batch
        assert_eq!(ui.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_retry_after_failed_rename_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"new").unwrap();

        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/a.txt", b"old", Utc::now());
            // the old target is deleted before the rename fails
            fs.inject_fault("rename_file", Some("/home/user/a.txt.filepart"), FaultKind::Operation, 1);
        }
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::YES, QueryAnswers::RETRY]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let completed = session
            .copy_to_remote(&[local_path(&a)], "/home/user", &CopyParams::default(), &TransferParams::default())
            .await
            .unwrap();

        assert!(completed);
        assert_eq!(fs.lock().content("/home/user/a.txt").unwrap(), b"new".to_vec());
        assert!(!fs.lock().exists("/home/user/a.txt.filepart"));
        assert_eq!(ui.queries().len(), 2);
        assert_eq!(ui.finished(), vec![(local_path(&a), true)]);
        assert_eq!(
            session.action_log().entries().last().unwrap().state,
            ActionState::Committed
        );
    }

    #[tokio::test]
    async fn test_upload_newer_only() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.txt");
        let fresh = dir.path().join("fresh.txt");
        std::fs::write(&old, b"local").unwrap();
        std::fs::write(&fresh, b"local").unwrap();
        let now = Utc::now();
        set_mtime(&old, now - Duration::days(2));
        set_mtime(&fresh, now);

        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/old.txt", b"remote", now - Duration::days(1));
            fs.add_file("/home/user/fresh.txt", b"remote", now - Duration::days(1));
        }
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let copy = CopyParams {
            newer_only: true,
            ..Default::default()
        };
        session
            .copy_to_remote(&[local_path(&old), local_path(&fresh)], "/home/user", &copy, &TransferParams::default())
            .await
            .unwrap();

        assert_eq!(fs.lock().content("/home/user/old.txt").unwrap(), b"remote".to_vec());
        assert_eq!(fs.lock().content("/home/user/fresh.txt").unwrap(), b"local".to_vec());
        assert!(ui.queries().is_empty());
    }

    #[tokio::test]
    async fn test_move_to_remote_removes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("out");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("x.bin"), [1u8, 2, 3]).unwrap();

        let fs = MemoryFs::new().shared();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let params = TransferParams {
            delete: true,
            ..Default::default()
        };
        let completed = session
            .copy_to_remote(&[local_path(&tree)], "/home/user", &CopyParams::default(), &params)
            .await
            .unwrap();

        assert!(completed);
        assert!(!tree.exists());
        assert_eq!(fs.lock().content("/home/user/out/x.bin").unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_download_tree_preserves_time() {
        let stamp = Utc.with_ymd_and_hms(2023, 6, 15, 8, 30, 0).unwrap();
        let fs = MemoryFs::new().shared();
        {
            let mut fs = fs.lock();
            fs.add_file("/home/user/docs/a.txt", b"alpha", stamp);
            fs.add_file("/home/user/docs/sub/b.txt", b"beta", stamp);
            fs.add_file("/home/user/docs/c.txt.filepart", b"partial", stamp);
        }
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let docs = session.files().find_file("docs").cloned().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let copy = CopyParams {
            calculate_size: true,
            ..Default::default()
        };
        let completed = session
            .copy_to_local(&[FileListItem::remote(docs)], dir.path(), &copy, &TransferParams::default())
            .await
            .unwrap();

        assert!(completed);
        let a = dir.path().join("docs/a.txt");
        assert_eq!(std::fs::read(&a).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dir.path().join("docs/sub/b.txt")).unwrap(), b"beta");
        assert!(!dir.path().join("docs/c.txt.filepart").exists());
        assert!(!dir.path().join("docs/a.txt.filepart").exists());
        let modified: DateTime<Utc> = std::fs::metadata(&a).unwrap().modified().unwrap().into();
        assert_eq!(modified, stamp);
        let actions = session.action_log().entries();
        assert!(actions
            .iter()
            .filter(|a| a.kind == ActionKind::Download)
            .all(|a| a.state == ActionState::Committed));
    }

    #[tokio::test]
    async fn test_move_to_local_deletes_remote() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/report.pdf", b"pdf", Utc::now());
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let params = TransferParams {
            delete: true,
            ..Default::default()
        };
        let completed = session
            .copy_to_local(
                &[FileListItem::path("/home/user/report.pdf")],
                dir.path(),
                &CopyParams::default(),
                &params,
            )
            .await
            .unwrap();

        assert!(completed);
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), b"pdf");
        assert!(!fs.lock().exists("/home/user/report.pdf"));
        assert!(session.files().find_file("report.pdf").is_none());
    }

    #[tokio::test]
    async fn test_failed_upload_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"a").unwrap();

        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::SKIP]);
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        let completed = session
            .copy_to_remote(&[local_path(&a)], "/home/user/missing", &CopyParams::default(), &TransferParams::default())
            .await
            .unwrap();

        assert!(completed);
        assert_eq!(ui.finished(), vec![(local_path(&a), false)]);
        assert_eq!(
            session.action_log().entries().last().unwrap().state,
            ActionState::Cancelled
        );
    }
}
