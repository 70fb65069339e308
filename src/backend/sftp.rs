//! SFTP backend
//!
//! Opens the `sftp` subsystem on a session channel of an authenticated SSH
//! connection and maps the uniform backend operations onto russh-sftp calls.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::error::BackendError;
use super::types::{
    Capability, FileSystemInfo, ModificationPrecision, RemoteFile, RemoteFileList,
    RemoteProperties, RemoteToken, SessionInfo,
};
use super::FileSystemBackend;
use crate::config::SessionData;
use crate::path_utils::{
    is_absolute_remote_path, join_remote_path, unix_exclude_trailing_slash,
    unix_extract_file_dir, unix_extract_file_name,
};
use crate::session::SessionCallbacks;
use crate::ssh::{HandleController, PingResult, SshClient, SshError};

/// I/O timeout of a single transfer chunk
const SFTP_IO_TIMEOUT: Duration = Duration::from_secs(300);
const CHUNK_SIZE: usize = 65536;

const CAPABILITIES: &[Capability] = &[
    Capability::ModeChanging,
    Capability::SymbolicLink,
    Capability::ResolveSymlink,
    Capability::Rename,
    Capability::RemoteMove,
    Capability::TimestampChanging,
    Capability::PreservingTimestampUpload,
    Capability::ModeChangingUpload,
    Capability::NewerOnlyUpload,
];

pub struct SftpBackend {
    data: SessionData,
    callbacks: Arc<dyn SessionCallbacks>,
    controller: Option<HandleController>,
    sftp: Option<RusshSftpSession>,
    home: String,
    cwd: String,
    fingerprint: Option<String>,
}

impl SftpBackend {
    pub fn new(data: SessionData, callbacks: Arc<dyn SessionCallbacks>) -> Self {
        Self {
            data,
            callbacks,
            controller: None,
            sftp: None,
            home: String::new(),
            cwd: String::new(),
            fingerprint: None,
        }
    }

    fn sftp(&self) -> Result<&RusshSftpSession, BackendError> {
        self.sftp.as_ref().ok_or(BackendError::NotConnected)
    }

    fn resolve(&self, path: &str) -> String {
        if is_absolute_remote_path(path) {
            path.to_string()
        } else if path.is_empty() || path == "." {
            self.base().to_string()
        } else {
            join_remote_path(self.base(), path)
        }
    }

    fn base(&self) -> &str {
        if self.cwd.is_empty() {
            &self.home
        } else {
            &self.cwd
        }
    }

    fn to_remote_file(name: &str, metadata: &FileAttributes) -> RemoteFile {
        let modification = metadata
            .mtime
            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
            .unwrap_or_else(Utc::now);
        let mut file = if metadata.is_dir() {
            RemoteFile::directory(name, modification)
        } else {
            RemoteFile::file(name, metadata.size.unwrap_or(0), modification)
        };
        file.modification_precision = ModificationPrecision::Full;
        file.permissions = metadata.permissions.map(|p| p & 0o7777);
        file.is_symlink = metadata.is_symlink();
        file.owner = metadata.uid.map(RemoteToken::with_id).unwrap_or_default();
        file.group = metadata.gid.map(RemoteToken::with_id).unwrap_or_default();
        file
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), BackendError> {
        let sftp = self.sftp()?;
        let metadata = sftp.symlink_metadata(path).await?;
        if metadata.is_dir() {
            let entries = sftp.read_dir(path).await?;
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                Box::pin(self.delete_recursive(&join_remote_path(path, &name))).await?;
            }
            sftp.remove_dir(path).await?;
        } else {
            sftp.remove_file(path).await?;
        }
        Ok(())
    }

    async fn set_properties(
        &self,
        path: &str,
        properties: &RemoteProperties,
    ) -> Result<(), BackendError> {
        let sftp = self.sftp()?;
        let mut attrs = FileAttributes::empty();
        attrs.permissions = properties.modes;
        attrs.uid = properties.owner.as_ref().and_then(|o| o.id);
        attrs.gid = properties.group.as_ref().and_then(|g| g.id);
        if let Some(modification) = properties.modification {
            let mtime = modification.timestamp().max(0) as u32;
            attrs.mtime = Some(mtime);
            attrs.atime = Some(
                properties
                    .last_access
                    .map(|t| t.timestamp().max(0) as u32)
                    .unwrap_or(mtime),
            );
        }
        sftp.set_metadata(path, attrs).await?;

        if properties.recursive {
            let metadata = sftp.metadata(path).await?;
            if metadata.is_dir() {
                for entry in sftp.read_dir(path).await? {
                    let name = entry.file_name();
                    if name == "." || name == ".." {
                        continue;
                    }
                    Box::pin(self.set_properties(&join_remote_path(path, &name), properties))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystemBackend for SftpBackend {
    async fn open(&mut self) -> Result<(), BackendError> {
        let connection = SshClient::new(self.data.ssh_config(), self.callbacks.clone())
            .connect()
            .await?;
        let controller = connection.controller;
        self.fingerprint = connection.host_key_fingerprint;

        info!("Opening SFTP subsystem for {}", self.data.session_name());
        let channel = controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::channel("sftp subsystem", e))?;
        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| BackendError::ProtocolError(e.to_string()))?;

        self.home = sftp.canonicalize(".").await?;
        self.cwd.clear();
        self.sftp = Some(sftp);
        self.controller = Some(controller);
        info!("SFTP subsystem opened, home directory {}", self.home);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                debug!("SFTP close failed: {}", e);
            }
        }
        if let Some(controller) = self.controller.take() {
            controller.disconnect().await;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.sftp.is_some()
            && self
                .controller
                .as_ref()
                .map(|c| c.is_connected())
                .unwrap_or(false)
    }

    async fn idle(&mut self) -> Result<(), BackendError> {
        let controller = self.controller.as_ref().ok_or(BackendError::NotConnected)?;
        match controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => {
                warn!("SFTP keepalive timed out");
                Ok(())
            }
            PingResult::IoError => Err(BackendError::ConnectionLost(
                "Keepalive failed".to_string(),
            )),
        }
    }

    fn current_directory(&self) -> String {
        self.cwd.clone()
    }

    async fn read_current_directory(&mut self) -> Result<(), BackendError> {
        if self.cwd.is_empty() {
            self.sftp()?;
            self.cwd = self.home.clone();
        }
        Ok(())
    }

    async fn read_directory(&mut self, list: &mut RemoteFileList) -> Result<(), BackendError> {
        let dir = self.resolve(list.directory());
        debug!("Listing directory: {}", dir);
        let sftp = self.sftp()?;
        let entries = sftp.read_dir(&dir).await?;
        let mut files = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." {
                continue;
            }
            let metadata = entry.metadata();
            let mut file = Self::to_remote_file(&name, &metadata);
            if file.is_symlink {
                let full = join_remote_path(&dir, &name);
                file.link_target = sftp.read_link(&full).await.ok();
                if let Ok(target) = sftp.metadata(&full).await {
                    file.is_directory = target.is_dir();
                    file.size = target.size.unwrap_or(file.size);
                }
            }
            files.push(file);
        }
        for file in files {
            list.add_file(file);
        }
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<RemoteFile, BackendError> {
        let full = self.resolve(path);
        let metadata = self.sftp()?.symlink_metadata(&full).await?;
        let mut file = Self::to_remote_file(&unix_extract_file_name(&full), &metadata);
        file.directory = unix_extract_file_dir(&full);
        if file.is_symlink {
            file.link_target = self.sftp()?.read_link(&full).await.ok();
        }
        Ok(file)
    }

    async fn change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        let target = self.resolve(dir);
        let sftp = self.sftp()?;
        let canonical = sftp.canonicalize(&target).await?;
        if !sftp.metadata(&canonical).await?.is_dir() {
            return Err(BackendError::OperationFailed(format!(
                "{} is not a directory",
                canonical
            )));
        }
        self.cwd = canonical;
        Ok(())
    }

    async fn cached_change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        self.sftp()?;
        self.cwd = unix_exclude_trailing_slash(dir);
        Ok(())
    }

    async fn home_directory(&mut self) -> Result<(), BackendError> {
        self.sftp()?;
        self.cwd = self.home.clone();
        Ok(())
    }

    async fn create_directory(&mut self, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(path);
        info!("Creating directory: {}", full);
        self.sftp()?.create_dir(&full).await?;
        Ok(())
    }

    async fn delete_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        info!("Deleting: {}", full);
        self.delete_recursive(&full).await
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        info!("Renaming {} to {}", source, target);
        self.sftp()?.rename(&source, &target).await?;
        Ok(())
    }

    async fn change_file_properties(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        self.set_properties(&full, properties).await
    }

    async fn create_link(
        &mut self,
        path: &str,
        point_to: &str,
        symbolic: bool,
    ) -> Result<(), BackendError> {
        if !symbolic {
            return Err(BackendError::NotSupported("hard links".to_string()));
        }
        let full = self.resolve(path);
        self.sftp()?.symlink(&full, point_to).await?;
        Ok(())
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote_path: &str,
        preserve_time: bool,
    ) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        debug!("Uploading {} to {}", local.display(), full);
        let mut local_file = tokio::fs::File::open(local).await?;
        let local_meta = local_file.metadata().await?;

        let sftp = self.sftp()?;
        let mut remote_file = sftp
            .open_with_flags(&full, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let read = local_file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            match tokio::time::timeout(SFTP_IO_TIMEOUT, remote_file.write_all(&buffer[..read])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(BackendError::IoError(e)),
                Err(_) => {
                    return Err(BackendError::ConnectionLost(format!(
                        "Write timeout after {:?}",
                        SFTP_IO_TIMEOUT
                    )))
                }
            }
            transferred += read as u64;
        }
        remote_file.flush().await?;
        remote_file.shutdown().await?;

        if preserve_time {
            let modification = DateTime::<Utc>::from(local_meta.modified()?);
            self.set_properties(&full, &RemoteProperties::modification(modification))
                .await?;
        }
        Ok(transferred)
    }

    async fn download_file(&mut self, remote_path: &str, local: &Path) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        debug!("Downloading {} to {}", full, local.display());
        let mut remote_file = self.sftp()?.open(&full).await?;
        let mut local_file = tokio::fs::File::create(local).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let read = match tokio::time::timeout(SFTP_IO_TIMEOUT, remote_file.read(&mut buffer)).await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(BackendError::IoError(e)),
                Err(_) => {
                    return Err(BackendError::ConnectionLost(format!(
                        "Read timeout after {:?}",
                        SFTP_IO_TIMEOUT
                    )))
                }
            };
            if read == 0 {
                break;
            }
            local_file.write_all(&buffer[..read]).await?;
            transferred += read as u64;
        }
        local_file.flush().await?;
        Ok(transferred)
    }

    fn is_capable(&self, capability: Capability) -> bool {
        CAPABILITIES.contains(&capability)
    }

    fn file_system_info(&self) -> FileSystemInfo {
        FileSystemInfo {
            protocol_base_name: "SFTP".to_string(),
            protocol_name: "SFTP-3".to_string(),
            remote_system: String::new(),
            additional_info: String::new(),
            capabilities: CAPABILITIES.to_vec(),
        }
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            protocol_name: "SFTP".to_string(),
            security_protocol_name: "SSH-2".to_string(),
            host_key_fingerprint: self.fingerprint.clone(),
        }
    }

    fn user_name(&self) -> String {
        self.data.user_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullCallbacks;

    fn backend() -> SftpBackend {
        SftpBackend::new(SessionData::default(), Arc::new(NullCallbacks))
    }

    #[test]
    fn test_resolve_relative_to_cwd() {
        let mut backend = backend();
        backend.home = "/home/user".to_string();
        assert_eq!(backend.resolve("a.txt"), "/home/user/a.txt");
        backend.cwd = "/srv".to_string();
        assert_eq!(backend.resolve("a.txt"), "/srv/a.txt");
        assert_eq!(backend.resolve("/etc/x"), "/etc/x");
        assert_eq!(backend.resolve("."), "/srv");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut backend = backend();
        assert!(!backend.is_active());
        let err = backend.create_directory("x").await.unwrap_err();
        assert!(matches!(err, BackendError::NotConnected));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_metadata_mapping() {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(42);
        attrs.mtime = Some(1_700_000_000);
        attrs.permissions = Some(0o100644);
        attrs.uid = Some(1000);
        let file = SftpBackend::to_remote_file("a.txt", &attrs);
        assert_eq!(file.size, 42);
        assert_eq!(file.modification.timestamp(), 1_700_000_000);
        assert_eq!(file.permissions, Some(0o644));
        assert_eq!(file.owner.id, Some(1000));
        assert!(!file.is_directory);
    }
}
