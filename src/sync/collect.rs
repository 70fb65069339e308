//! Checklist collection

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    ChecklistAction, ChecklistItem, FileInfo, SynchronizeChecklist, SynchronizeDirectory,
    SynchronizeMode, SynchronizeParams, SynchronizeRequest,
};
use crate::backend::{compare_file_time, ModificationPrecision, RemoteFile};
use crate::path_utils::{
    include_trailing_separator, unix_exclude_trailing_slash, unix_include_trailing_slash,
};
use crate::session::transfer::modification_of;
use crate::session::{OperationSide, Session, SessionError};

/// Local entry waiting to be matched with the remote listing
struct LocalEntry {
    is_directory: bool,
    info: FileInfo,
    last_write_time: DateTime<Utc>,
    new: bool,
    modified: bool,
    /// Remote counterpart when the local file is the newer one
    matching_remote: Option<(FileInfo, RemoteFile)>,
}

struct LocalListing {
    name: String,
    is_directory: bool,
    size: u64,
    modification: DateTime<Utc>,
}

fn read_local_directory(directory: &Path) -> std::io::Result<Vec<LocalListing>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        // links are taken as they are, never followed
        let metadata = entry.metadata()?;
        entries.push(LocalListing {
            name: entry.file_name().to_string_lossy().to_string(),
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modification: modification_of(&metadata),
        });
    }
    Ok(entries)
}

/// Report the directory pair; `Abort` when the callback clears `continue`
pub(super) fn synchronize_progress(
    on_directory: &mut Option<&mut SynchronizeDirectory<'_>>,
    local_directory: &str,
    remote_directory: &str,
    collect: bool,
) -> Result<(), SessionError> {
    if let Some(callback) = on_directory.as_mut() {
        let mut proceed = true;
        callback(local_directory, remote_directory, &mut proceed, collect);
        if !proceed {
            return Err(SessionError::Abort);
        }
    }
    Ok(())
}

/// Should a new or deleted directory be checked by default
fn directory_checked(is_directory: bool, params: &SynchronizeParams) -> bool {
    !is_directory || !params.no_recurse || params.sub_dirs
}

impl Session {
    /// Compare the local and remote trees of `request` and list what to do
    pub async fn synchronize_collect(
        &mut self,
        request: &SynchronizeRequest,
        mut on_directory: Option<&mut SynchronizeDirectory<'_>>,
    ) -> Result<SynchronizeChecklist, SessionError> {
        let mut checklist = SynchronizeChecklist::new();
        self.collect_directory(
            request,
            &request.local_directory,
            &request.remote_directory,
            true,
            &mut on_directory,
            &mut checklist,
        )
        .await?;
        checklist.sort();
        Ok(checklist)
    }

    fn synchronize_filter_allows(
        &self,
        request: &SynchronizeRequest,
        first_level: bool,
        full_path: &str,
        side: OperationSide,
        name: &str,
        is_directory: bool,
    ) -> bool {
        let other_name = request.copy_param.change_file_name(name, side, false);
        request.copy_param.allow_transfer(full_path, side, is_directory)
            && !self.temporary_transfer_file(name)
            && (!first_level
                || request.options.as_ref().map_or(true, |options| {
                    options.matches_filter(name) || options.matches_filter(&other_name)
                }))
    }

    async fn collect_directory(
        &mut self,
        request: &SynchronizeRequest,
        local_directory: &str,
        remote_directory: &str,
        first_level: bool,
        on_directory: &mut Option<&mut SynchronizeDirectory<'_>>,
        checklist: &mut SynchronizeChecklist,
    ) -> Result<(), SessionError> {
        let params = &request.params;
        let mode = request.mode;
        let local_dir = include_trailing_separator(local_directory);
        let remote_dir = unix_include_trailing_slash(remote_directory);

        info!(
            "Collecting synchronization list for local directory '{}' and remote directory '{}', mode = {:?}",
            local_directory, remote_directory, mode
        );

        if !params.delay_progress {
            synchronize_progress(on_directory, &local_dir, &remote_dir, true)?;
        }

        let message = format!("Error listing directory '{}'", local_directory);
        let path = Path::new(local_directory).to_path_buf();
        let listing = self
            .file_operation_loop(&message, false, None, |_| read_local_directory(&path))
            .await?;

        let mut local_files: HashMap<String, LocalEntry> = HashMap::new();
        for entry in listing {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let full_path = format!("{}{}", local_dir, entry.name);
            let stamp = entry.modification.format("%Y-%m-%dT%H:%M:%S");
            if self.synchronize_filter_allows(
                request,
                first_level,
                &full_path,
                OperationSide::Local,
                &entry.name,
                entry.is_directory,
            ) {
                debug!(
                    "Local file '{}' [{}] [{}] included to synchronization",
                    full_path, stamp, entry.size
                );
                local_files.insert(
                    entry.name.to_lowercase(),
                    LocalEntry {
                        is_directory: entry.is_directory,
                        info: FileInfo {
                            file_name: entry.name,
                            directory: local_dir.clone(),
                            size: entry.size,
                            modification: entry.modification,
                            modification_precision: ModificationPrecision::Full,
                        },
                        last_write_time: entry.modification,
                        new: true,
                        modified: false,
                        matching_remote: None,
                    },
                );
            } else {
                debug!(
                    "Local file '{}' [{}] [{}] excluded from synchronization",
                    full_path, stamp, entry.size
                );
            }
        }

        let cached = params.use_cache
            && self.session_data().cache_directories
            && self.directory_cache().has_file_list(remote_directory);
        if !cached && params.delay_progress {
            synchronize_progress(on_directory, &local_dir, &remote_dir, true)?;
        }

        let remote_files = self
            .process_directory(remote_directory, params.use_cache, false)
            .await?;
        for (full_path, file) in remote_files {
            let full_path = unix_exclude_trailing_slash(&full_path);
            let stamp = file.modification.format("%Y-%m-%dT%H:%M:%S");
            if !self.synchronize_filter_allows(
                request,
                first_level,
                &full_path,
                OperationSide::Remote,
                &file.name,
                file.is_directory,
            ) {
                debug!(
                    "Remote file '{}' [{}] [{}] excluded from synchronization",
                    full_path, stamp, file.size
                );
                continue;
            }

            let mut item = ChecklistItem {
                is_directory: file.is_directory,
                remote: FileInfo::from_remote(&file, &remote_dir),
                ..Default::default()
            };
            let local_name = request
                .copy_param
                .change_file_name(&file.name, OperationSide::Remote, false);

            let mut modified = false;
            let new = match local_files.get_mut(&local_name.to_lowercase()) {
                None => {
                    item.local.directory = local_dir.clone();
                    debug!("Remote file '{}' [{}] [{}] is new", full_path, stamp, file.size);
                    true
                }
                Some(local) => {
                    local.new = false;
                    if file.is_directory != local.is_directory {
                        info!(
                            "{} is directory on one side, but file on the another",
                            file.name
                        );
                    } else if !file.is_directory {
                        item.local = local.info.clone();
                        item.local.modification =
                            file.modification_precision.reduce(item.local.modification);
                        item.local_last_write_time = Some(local.last_write_time);

                        let (remote_newer, local_newer) = compare_sides(&item, mode, params);
                        modified = remote_newer;
                        if local_newer {
                            local.modified = true;
                            local.matching_remote = Some((item.remote.clone(), file.clone()));
                            debug!(
                                "Local file '{}' is modified comparing to remote file '{}'",
                                local.info.full_path(),
                                full_path
                            );
                        }
                        if modified {
                            debug!(
                                "Remote file '{}' is modified comparing to local file '{}'",
                                full_path,
                                local.info.full_path()
                            );
                        }
                    } else if !params.no_recurse {
                        let local_subdirectory = format!("{}{}", local_dir, local.info.file_name);
                        let remote_subdirectory = format!("{}{}", remote_dir, file.name);
                        Box::pin(self.collect_directory(
                            request,
                            &local_subdirectory,
                            &remote_subdirectory,
                            false,
                            on_directory,
                            checklist,
                        ))
                        .await?;
                    }
                    false
                }
            };

            if new || modified {
                if mode.updates_local() {
                    if !params.timestamp || modified {
                        item.action = if modified {
                            ChecklistAction::DownloadUpdate
                        } else {
                            ChecklistAction::DownloadNew
                        };
                        item.checked = (modified || !params.existing_only)
                            && directory_checked(item.is_directory, params);
                    }
                } else if mode == SynchronizeMode::Remote && new && !params.timestamp {
                    item.action = ChecklistAction::DeleteRemote;
                    item.checked = params.delete && directory_checked(item.is_directory, params);
                }

                if item.action != ChecklistAction::None {
                    item.remote_file = Some(file);
                    checklist.add(item);
                }
            }
        }

        for local in local_files.into_values() {
            let modified = local.modified && mode.updates_remote();
            let new = local.new
                && (mode == SynchronizeMode::Local
                    || (mode.updates_remote() && !params.timestamp));
            if new {
                debug!("Local file '{}' is new", local.info.full_path());
            }
            if !modified && !new {
                continue;
            }

            let mut item = ChecklistItem {
                is_directory: local.is_directory,
                local: local.info,
                local_last_write_time: Some(local.last_write_time),
                ..Default::default()
            };
            match local.matching_remote {
                Some((remote, file)) if modified => {
                    item.remote = remote;
                    item.remote_file = Some(file);
                }
                _ => item.remote = FileInfo::in_directory(&remote_dir),
            }

            if mode.updates_remote() {
                item.action = if modified {
                    ChecklistAction::UploadUpdate
                } else {
                    ChecklistAction::UploadNew
                };
                item.checked = (modified || !params.existing_only)
                    && directory_checked(item.is_directory, params);
            } else if mode == SynchronizeMode::Local && !params.timestamp {
                item.action = ChecklistAction::DeleteLocal;
                item.checked = params.delete && directory_checked(item.is_directory, params);
            }

            if item.action != ChecklistAction::None {
                checklist.add(item);
            }
        }
        Ok(())
    }
}

/// Which sides of a file pair count as modified: `(remote, local)`.
///
/// With differing sizes at equal times both sides are modified; the mode
/// decides which one is transferred.
fn compare_sides(
    item: &ChecklistItem,
    mode: SynchronizeMode,
    params: &SynchronizeParams,
) -> (bool, bool) {
    let same_size = item.local.size == item.remote.size;
    let time_compare = if !params.not_by_time && (!params.timestamp || !params.by_size || same_size)
    {
        compare_file_time(
            item.local.modification,
            item.local.modification_precision,
            item.remote.modification,
            item.remote.modification_precision,
        )
    } else {
        Ordering::Equal
    };
    let plain = !params.timestamp && !params.mirror;

    match time_compare {
        Ordering::Less if plain || mode.updates_local() => (true, false),
        Ordering::Less => (false, true),
        Ordering::Greater if plain || mode.updates_remote() => (false, true),
        Ordering::Greater => (true, false),
        Ordering::Equal if params.by_size && !same_size && !params.timestamp => (true, true),
        Ordering::Equal => (false, false),
    }
}
