//! Checklist application

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::collect::synchronize_progress;
use super::{ChecklistAction, ChecklistItem, SynchronizeChecklist, SynchronizeDirectory, SynchronizeParams};
use crate::backend::{RemoteFile, RemoteProperties};
use crate::config::CopyParams;
use crate::path_utils::unix_exclude_trailing_slash;
use crate::session::operations::FileProcessor;
use crate::session::{
    DeleteParams, FileListItem, FileOperation, OperationSide, Session, SessionError, TransferParams,
};

/// Checked items of one directory pair, by what happens to them
#[derive(Default)]
struct Buckets<'a> {
    download: Vec<&'a ChecklistItem>,
    delete_remote: Vec<&'a ChecklistItem>,
    upload: Vec<&'a ChecklistItem>,
    delete_local: Vec<&'a ChecklistItem>,
    /// Timestamp mode only
    touch_local: Vec<&'a ChecklistItem>,
    touch_remote: Vec<&'a ChecklistItem>,
}

impl<'a> Buckets<'a> {
    fn add(&mut self, item: &'a ChecklistItem, timestamp: bool) {
        match item.action {
            ChecklistAction::DownloadUpdate if timestamp => self.touch_local.push(item),
            ChecklistAction::UploadUpdate if timestamp => self.touch_remote.push(item),
            // nothing else is done in timestamp mode
            _ if timestamp => {}
            ChecklistAction::DownloadNew | ChecklistAction::DownloadUpdate => self.download.push(item),
            ChecklistAction::UploadNew | ChecklistAction::UploadUpdate => self.upload.push(item),
            ChecklistAction::DeleteRemote => self.delete_remote.push(item),
            ChecklistAction::DeleteLocal => self.delete_local.push(item),
            ChecklistAction::None => {}
        }
    }

    fn count(&self) -> usize {
        self.download.len()
            + self.delete_remote.len()
            + self.upload.len()
            + self.delete_local.len()
            + self.touch_local.len()
            + self.touch_remote.len()
    }
}

/// Local file path to the remote modification time it takes
struct LocalTimestampProcessor(BTreeMap<String, DateTime<Utc>>);

#[async_trait]
impl FileProcessor for LocalTimestampProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        let Some(modification) = self.0.get(file_name).copied() else {
            return Ok(());
        };
        info!("Updating timestamp of local file '{}'", file_name);
        session
            .set_local_file_time(Path::new(file_name), modification)
            .await
    }
}

/// Remote file path to the local modification time it takes
struct RemoteTimestampProcessor(BTreeMap<String, DateTime<Utc>>);

#[async_trait]
impl FileProcessor for RemoteTimestampProcessor {
    async fn process(
        &mut self,
        session: &mut Session,
        file_name: &str,
        file: Option<&RemoteFile>,
    ) -> Result<(), SessionError> {
        let Some(modification) = self.0.get(file_name).copied() else {
            return Ok(());
        };
        info!("Updating timestamp of remote file '{}'", file_name);
        session
            .change_file_properties(file_name, file, &RemoteProperties::modification(modification))
            .await
    }
}

fn remote_item(item: &ChecklistItem) -> FileListItem {
    FileListItem {
        name: item.remote.full_path(),
        file: item.remote_file.clone(),
    }
}

/// Consecutive items sharing the same local and remote directory
fn directory_groups(items: &[ChecklistItem]) -> Vec<&[ChecklistItem]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for index in 1..=items.len() {
        let boundary = index == items.len()
            || items[index].local.directory != items[start].local.directory
            || items[index].remote.directory != items[start].remote.directory;
        if boundary {
            groups.push(&items[start..index]);
            start = index;
        }
    }
    groups
}

impl Session {
    /// Carry out the checked items of `checklist`
    pub async fn synchronize_apply(
        &mut self,
        checklist: &SynchronizeChecklist,
        copy_param: &CopyParams,
        params: SynchronizeParams,
        mut on_directory: Option<&mut SynchronizeDirectory<'_>>,
    ) -> Result<(), SessionError> {
        let mut copy_param = copy_param.clone();
        if !params.not_by_time {
            copy_param.preserve_time = true;
        }
        if params.no_confirmation {
            copy_param.no_confirmation = true;
        }
        info!(
            "Applying synchronization checklist of {} items ({} checked)",
            checklist.len(),
            checklist.checked_count()
        );

        self.begin_transaction();
        let result = self
            .apply_groups(checklist, &copy_param, params, &mut on_directory)
            .await;
        let ended = self.end_transaction().await;
        match (result, ended) {
            (Err(e), Err(end)) => {
                warn!("Ending transaction after failed synchronization: {}", end);
                Err(e)
            }
            (result, ended) => result.and(ended),
        }
    }

    async fn apply_groups(
        &mut self,
        checklist: &SynchronizeChecklist,
        copy_param: &CopyParams,
        params: SynchronizeParams,
        on_directory: &mut Option<&mut SynchronizeDirectory<'_>>,
    ) -> Result<(), SessionError> {
        for group in directory_groups(checklist.items()) {
            let mut buckets = Buckets::default();
            for item in group.iter().filter(|item| item.checked) {
                buckets.add(item, params.timestamp);
            }
            if buckets.count() == 0 {
                continue;
            }

            let local_directory = &group[0].local.directory;
            let remote_directory = &group[0].remote.directory;
            synchronize_progress(on_directory, local_directory, remote_directory, false)?;

            if params.timestamp {
                self.apply_timestamps(&buckets).await?;
            } else {
                self.apply_transfers(&buckets, local_directory, remote_directory, copy_param)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_timestamps(&mut self, buckets: &Buckets<'_>) -> Result<(), SessionError> {
        if !buckets.touch_local.is_empty() {
            let mut processor = LocalTimestampProcessor(
                buckets
                    .touch_local
                    .iter()
                    .map(|item| (item.local.full_path(), item.remote.modification))
                    .collect(),
            );
            let files: Vec<FileListItem> = buckets
                .touch_local
                .iter()
                .map(|item| FileListItem::path(item.local.full_path()))
                .collect();
            if !self
                .process_files(&files, FileOperation::SetProperties, &mut processor, OperationSide::Local)
                .await?
            {
                return Err(SessionError::Abort);
            }
        }

        let touch_remote: Vec<(&ChecklistItem, DateTime<Utc>)> = buckets
            .touch_remote
            .iter()
            .filter_map(|item| item.local_last_write_time.map(|time| (*item, time)))
            .collect();
        if !touch_remote.is_empty() {
            let files: Vec<FileListItem> = touch_remote.iter().map(|(item, _)| remote_item(item)).collect();
            let mut processor = RemoteTimestampProcessor(
                touch_remote
                    .iter()
                    .map(|(item, time)| (item.remote.full_path(), *time))
                    .collect(),
            );
            if !self
                .process_files(&files, FileOperation::SetProperties, &mut processor, OperationSide::Remote)
                .await?
            {
                return Err(SessionError::Abort);
            }
        }
        Ok(())
    }

    async fn apply_transfers(
        &mut self,
        buckets: &Buckets<'_>,
        local_directory: &str,
        remote_directory: &str,
        copy_param: &CopyParams,
    ) -> Result<(), SessionError> {
        let transfer = TransferParams::default();

        if !buckets.download.is_empty() {
            let files: Vec<FileListItem> = buckets.download.iter().map(|i| remote_item(i)).collect();
            if !self
                .copy_to_local(&files, Path::new(local_directory), copy_param, &transfer)
                .await?
            {
                return Err(SessionError::Abort);
            }
        }

        if !buckets.delete_remote.is_empty() {
            let files: Vec<FileListItem> =
                buckets.delete_remote.iter().map(|i| remote_item(i)).collect();
            if !self.delete_files(&files, DeleteParams::default()).await? {
                return Err(SessionError::Abort);
            }
        }

        if !buckets.upload.is_empty() {
            let files: Vec<String> = buckets.upload.iter().map(|i| i.local.full_path()).collect();
            let target = unix_exclude_trailing_slash(remote_directory);
            if !self
                .copy_to_remote(&files, &target, copy_param, &transfer)
                .await?
            {
                return Err(SessionError::Abort);
            }
        }

        if !buckets.delete_local.is_empty() {
            let files: Vec<String> =
                buckets.delete_local.iter().map(|i| i.local.full_path()).collect();
            if !self.delete_local_files(&files).await? {
                return Err(SessionError::Abort);
            }
        }
        Ok(())
    }
}
