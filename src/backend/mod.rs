//! File System Backend Module
//!
//! A backend adapts one wire protocol to the uniform set of file operations the
//! session drives. Exactly one backend is active per open session.
//!
//! # Implementations
//! - [`SftpBackend`]: SFTP subsystem over russh
//! - [`ShellBackend`]: shell commands over SSH exec channels (SCP-only sessions and
//!   the secondary command session)
//! - [`MemoryBackend`]: in-process file tree, used by tests and embedders

pub mod error;
pub mod memory;
pub mod sftp;
pub mod shell;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Protocol, SessionData};
use crate::session::SessionCallbacks;

pub use error::BackendError;
pub use memory::{FaultKind, MemoryBackend, MemoryBackendFactory, MemoryFs};
pub use sftp::SftpBackend;
pub use shell::ShellBackend;
pub use types::{
    compare_file_time, Capability, FileSystemInfo, ModificationPrecision, RemoteFile,
    RemoteFileList, RemoteProperties, RemoteToken, SessionInfo, SpaceAvailable,
};

/// Suffix of files being transferred
pub const PARTIAL_EXT: &str = ".filepart";

/// Quote for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Expand custom command patterns.
///
/// `!!` is a literal `!`, `!&` the file list and a lone `!` the file.
pub fn expand_command_patterns(command: &str, file: &str, file_list: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '!' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('!') => {
                chars.next();
                out.push('!');
            }
            Some('&') => {
                chars.next();
                out.push_str(file_list);
            }
            _ => out.push_str(file),
        }
    }
    out
}

fn command_patterns(command: &str) -> (bool, bool) {
    let (mut file, mut list) = (false, false);
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '!' {
            continue;
        }
        match chars.peek() {
            Some('!') => {
                chars.next();
            }
            Some('&') => {
                chars.next();
                list = true;
            }
            _ => file = true,
        }
    }
    (file, list)
}

/// Does the command take the whole file list at once (`!&`)
pub fn is_file_list_command(command: &str) -> bool {
    command_patterns(command).1
}

/// Command line for one file; the path is appended when the command has no `!`
pub fn file_command(command: &str, quoted_path: &str) -> String {
    if command_patterns(command).0 {
        expand_command_patterns(command, quoted_path, quoted_path)
    } else {
        format!("{} {}", expand_command_patterns(command, "", ""), quoted_path)
    }
}

/// Uniform remote file operations
///
/// Paths are absolute or relative to the backend's current directory.
#[async_trait]
pub trait FileSystemBackend: Send + Sync {
    async fn open(&mut self) -> Result<(), BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;

    fn is_active(&self) -> bool;

    /// Keep the connection alive
    async fn idle(&mut self) -> Result<(), BackendError>;

    /// Protocol-specific startup conversation
    async fn do_startup(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Last known current directory, empty when not read yet
    fn current_directory(&self) -> String;

    async fn read_current_directory(&mut self) -> Result<(), BackendError>;

    /// Fill `list` with the entries of `list.directory()`
    async fn read_directory(&mut self, list: &mut RemoteFileList) -> Result<(), BackendError>;

    async fn read_file(&mut self, path: &str) -> Result<RemoteFile, BackendError>;

    async fn read_symlink(&mut self, file: &RemoteFile) -> Result<RemoteFile, BackendError> {
        self.read_file(&file.full_path()).await
    }

    async fn change_directory(&mut self, dir: &str) -> Result<(), BackendError>;

    /// Enter a directory whose canonical path is already known
    async fn cached_change_directory(&mut self, dir: &str) -> Result<(), BackendError>;

    async fn home_directory(&mut self) -> Result<(), BackendError>;

    async fn create_directory(&mut self, path: &str) -> Result<(), BackendError>;

    /// Delete a file or a directory with its contents
    async fn delete_file(&mut self, path: &str, file: Option<&RemoteFile>)
        -> Result<(), BackendError>;

    async fn rename_file(&mut self, from: &str, to: &str) -> Result<(), BackendError>;

    async fn copy_file(&mut self, _from: &str, _to: &str) -> Result<(), BackendError> {
        Err(BackendError::NotSupported("remote copy".to_string()))
    }

    async fn change_file_properties(
        &mut self,
        path: &str,
        file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), BackendError>;

    async fn create_link(
        &mut self,
        path: &str,
        point_to: &str,
        symbolic: bool,
    ) -> Result<(), BackendError>;

    /// Run an arbitrary command, returning its output lines
    async fn any_command(&mut self, _command: &str) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotSupported("arbitrary commands".to_string()))
    }

    async fn custom_command_on_file(
        &mut self,
        _path: &str,
        _file: Option<&RemoteFile>,
        _command: &str,
    ) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotSupported("custom commands".to_string()))
    }

    /// Upload one local file to `remote_path`, returning the number of bytes written
    async fn upload_file(
        &mut self,
        local: &Path,
        remote_path: &str,
        preserve_time: bool,
    ) -> Result<u64, BackendError>;

    /// Download `remote_path` into `local`, returning the number of bytes read
    async fn download_file(&mut self, remote_path: &str, local: &Path)
        -> Result<u64, BackendError>;

    async fn lookup_users_groups(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn space_available(&mut self, _path: &str) -> Result<SpaceAvailable, BackendError> {
        Err(BackendError::NotSupported("space available".to_string()))
    }

    fn is_capable(&self, capability: Capability) -> bool;

    /// Is `name` an in-progress transfer file
    fn temporary_transfer_file(&self, name: &str) -> bool {
        name.ends_with(PARTIAL_EXT)
    }

    fn file_system_info(&self) -> FileSystemInfo;

    fn session_info(&self) -> SessionInfo;

    fn user_name(&self) -> String;
}

/// Creates the backend for a protocol
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        protocol: Protocol,
        data: &SessionData,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<Box<dyn FileSystemBackend>, BackendError>;
}

/// SSH-based backends; FTP and WebDAV adapters are supplied by the embedder
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(
        &self,
        protocol: Protocol,
        data: &SessionData,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<Box<dyn FileSystemBackend>, BackendError> {
        match protocol {
            Protocol::Sftp | Protocol::SftpOnly => {
                Ok(Box::new(SftpBackend::new(data.clone(), callbacks)))
            }
            Protocol::Scp | Protocol::ScpOnly => {
                Ok(Box::new(ShellBackend::new(data.clone(), callbacks)))
            }
            Protocol::Ftp | Protocol::WebDav => {
                Err(BackendError::UnsupportedProtocol(protocol.name().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullCallbacks;

    #[test]
    fn test_command_patterns() {
        assert_eq!(expand_command_patterns("grep !! !", "'a'", ""), "grep ! 'a'");
        assert_eq!(expand_command_patterns("tar cf x.tar !&", "", "'a' 'b'"), "tar cf x.tar 'a' 'b'");
        assert!(is_file_list_command("wc !&"));
        assert!(!is_file_list_command("echo !!&"));
        assert_eq!(file_command("chmod +x", "'/a'"), "chmod +x '/a'");
        assert_eq!(file_command("cp ! !.bak", "'/a'"), "cp '/a' '/a'.bak");
    }

    #[test]
    fn test_default_factory_protocols() {
        let factory = DefaultBackendFactory;
        let data = SessionData::with_password("example.com", 22, "alice", "secret");
        let callbacks: Arc<dyn SessionCallbacks> = Arc::new(NullCallbacks);

        let sftp = factory.create(Protocol::Sftp, &data, callbacks.clone()).unwrap();
        assert!(!sftp.is_active());
        assert_eq!(sftp.file_system_info().protocol_base_name, "SFTP");

        let scp = factory.create(Protocol::ScpOnly, &data, callbacks.clone()).unwrap();
        assert!(scp.is_capable(Capability::AnyCommand));

        assert!(matches!(
            factory.create(Protocol::WebDav, &data, callbacks),
            Err(BackendError::UnsupportedProtocol(_))
        ));
    }
}
