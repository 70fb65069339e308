//! Shell backend
//!
//! Runs POSIX shell commands over SSH exec channels. Used for SCP-only sessions
//! and as the secondary command session of SFTP sessions. Every command runs in
//! its own channel, prefixed with `cd` into the tracked current directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, TimeZone, Utc};
use russh::ChannelMsg;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::error::BackendError;
use super::types::{
    Capability, FileSystemInfo, ModificationPrecision, RemoteFile, RemoteFileList,
    RemoteProperties, RemoteToken, SessionInfo,
};
use super::{file_command, shell_quote, FileSystemBackend};
use crate::config::SessionData;
use crate::path_utils::{
    is_absolute_remote_path, join_remote_path, unix_exclude_trailing_slash,
    unix_extract_file_dir, unix_extract_file_name,
};
use crate::session::SessionCallbacks;
use crate::ssh::{HandleController, PingResult, SshClient, SshError};

/// Upper bound for a single command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const CHUNK_SIZE: usize = 65536;
const LIST_COMMAND: &str = "LC_ALL=C ls -la --time-style=+%s";

const CAPABILITIES: &[Capability] = &[
    Capability::UserGroupListing,
    Capability::ModeChanging,
    Capability::GroupChanging,
    Capability::OwnerChanging,
    Capability::AnyCommand,
    Capability::ShellAnyCommand,
    Capability::SymbolicLink,
    Capability::HardLink,
    Capability::Rename,
    Capability::RemoteCopy,
    Capability::RemoteMove,
    Capability::TimestampChanging,
    Capability::PreservingTimestampUpload,
];

/// Collected result of one command
#[derive(Debug, Default)]
struct ExecOutput {
    stdout: BytesMut,
    stderr: BytesMut,
    exit_status: Option<u32>,
}

impl ExecOutput {
    fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    fn stdout_lines(&self) -> Vec<String> {
        text_lines(&self.stdout)
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Map a failed command to a backend error
    fn check(self, what: &str) -> Result<ExecOutput, BackendError> {
        if self.success() {
            return Ok(self);
        }
        let message = match self.stderr_text() {
            text if text.is_empty() => format!(
                "{} failed with exit status {}",
                what,
                self.exit_status.map(|s| s.to_string()).unwrap_or_else(|| "?".into())
            ),
            text => format!("{}: {}", what, text),
        };
        if message.contains("No such file") {
            Err(BackendError::FileNotFound(message))
        } else if message.contains("Permission denied") {
            Err(BackendError::PermissionDenied(message))
        } else {
            Err(BackendError::OperationFailed(message))
        }
    }
}

fn text_lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .map(|l| l.to_string())
        .collect()
}

/// Parse `drwxr-xr-x` style rights into mode bits
fn parse_mode(rights: &str) -> Option<u32> {
    let chars: Vec<char> = rights.chars().collect();
    if chars.len() < 10 {
        return None;
    }
    let mut mode = 0u32;
    for (group, shift) in [(1usize, 6u32), (4, 3), (7, 0)] {
        if chars[group] == 'r' {
            mode |= 0o4 << shift;
        }
        if chars[group + 1] == 'w' {
            mode |= 0o2 << shift;
        }
        match chars[group + 2] {
            'x' => mode |= 0o1 << shift,
            's' | 't' => {
                mode |= 0o1 << shift;
                mode |= special_bit(shift);
            }
            'S' | 'T' => mode |= special_bit(shift),
            _ => {}
        }
    }
    Some(mode)
}

fn special_bit(shift: u32) -> u32 {
    match shift {
        6 => 0o4000,
        3 => 0o2000,
        _ => 0o1000,
    }
}

/// Parse one line of `ls -la --time-style=+%s`
fn parse_listing_line(line: &str) -> Option<RemoteFile> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(6);
    for _ in 0..6 {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }

    let rights = fields[0];
    let kind = rights.chars().next()?;
    let size: u64 = fields[4].parse().ok()?;
    let seconds: i64 = fields[5].parse().ok()?;
    let modification = Utc.timestamp_opt(seconds, 0).single()?;

    let (name, link_target) = match (kind, rest.split_once(" -> ")) {
        ('l', Some((name, target))) => (name, Some(target.to_string())),
        _ => (rest, None),
    };

    let mut file = if kind == 'd' {
        RemoteFile::directory(name, modification)
    } else {
        RemoteFile::file(name, size, modification)
    };
    file.size = size;
    file.modification_precision = ModificationPrecision::Full;
    file.permissions = parse_mode(rights);
    file.owner = RemoteToken::named(fields[2]);
    file.group = RemoteToken::named(fields[3]);
    file.is_symlink = kind == 'l';
    file.link_target = link_target;
    Some(file)
}

pub struct ShellBackend {
    data: SessionData,
    callbacks: Arc<dyn SessionCallbacks>,
    controller: Option<HandleController>,
    home: String,
    cwd: String,
    groups: Vec<String>,
    fingerprint: Option<String>,
}

impl ShellBackend {
    pub fn new(data: SessionData, callbacks: Arc<dyn SessionCallbacks>) -> Self {
        Self {
            data,
            callbacks,
            controller: None,
            home: String::new(),
            cwd: String::new(),
            groups: Vec::new(),
            fingerprint: None,
        }
    }

    /// Groups reported by the last lookup
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    fn controller(&self) -> Result<&HandleController, BackendError> {
        self.controller.as_ref().ok_or(BackendError::NotConnected)
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

    fn in_cwd(&self, command: &str) -> String {
        match self.base() {
            "" => command.to_string(),
            dir => format!("cd {} && {}", shell_quote(dir), command),
        }
    }

    /// Run `command`, optionally feeding `input` to its stdin
    async fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, BackendError> {
        debug!("Executing: {}", command);
        let mut channel = self.controller()?.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::channel("command execution", e))?;

        if let Some(input) = input {
            for chunk in input.chunks(CHUNK_SIZE) {
                channel
                    .data(chunk)
                    .await
                    .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
            }
        }
        channel
            .eof()
            .await
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;

        let mut output = ExecOutput::default();
        let drain = tokio::time::timeout(COMMAND_TIMEOUT, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        output.stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        output.exit_status = Some(exit_status)
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        })
        .await;

        if drain.is_err() {
            let _ = channel.close().await;
            return Err(BackendError::ConnectionLost(format!(
                "Command timed out after {:?}",
                COMMAND_TIMEOUT
            )));
        }
        Ok(output)
    }

    async fn run(&self, command: &str, what: &str) -> Result<ExecOutput, BackendError> {
        self.exec(&self.in_cwd(command), None).await?.check(what)
    }

    async fn change_to(&mut self, command: &str) -> Result<(), BackendError> {
        let output = self.run(command, "Changing directory").await?;
        let dir = output
            .stdout_lines()
            .into_iter()
            .rev()
            .find(|l| !l.is_empty())
            .ok_or_else(|| BackendError::ProtocolError("pwd returned nothing".to_string()))?;
        self.cwd = dir;
        Ok(())
    }
}

#[async_trait]
impl FileSystemBackend for ShellBackend {
    async fn open(&mut self) -> Result<(), BackendError> {
        let connection = SshClient::new(self.data.ssh_config(), self.callbacks.clone())
            .connect()
            .await?;
        self.fingerprint = connection.host_key_fingerprint;
        self.controller = Some(connection.controller);

        let output = self.exec("pwd", None).await?.check("Reading home directory")?;
        self.home = output
            .stdout_lines()
            .into_iter()
            .find(|l| !l.is_empty())
            .unwrap_or_else(|| "/".to_string());
        self.cwd.clear();
        info!("Shell session opened, home directory {}", self.home);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(controller) = self.controller.take() {
            controller.disconnect().await;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.controller
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    async fn idle(&mut self) -> Result<(), BackendError> {
        match self.controller()?.ping().await {
            PingResult::IoError => Err(BackendError::ConnectionLost(
                "Keepalive failed".to_string(),
            )),
            PingResult::Timeout => {
                warn!("Shell keepalive timed out");
                Ok(())
            }
            PingResult::Ok => Ok(()),
        }
    }

    fn current_directory(&self) -> String {
        self.cwd.clone()
    }

    async fn read_current_directory(&mut self) -> Result<(), BackendError> {
        if self.cwd.is_empty() {
            self.controller()?;
            self.cwd = self.home.clone();
        }
        Ok(())
    }

    async fn read_directory(&mut self, list: &mut RemoteFileList) -> Result<(), BackendError> {
        let dir = self.resolve(list.directory());
        let output = self
            .run(&format!("{} {}", LIST_COMMAND, shell_quote(&dir)), "Listing directory")
            .await?;
        for line in output.stdout_lines() {
            if line.starts_with("total ") || line.is_empty() {
                continue;
            }
            match parse_listing_line(&line) {
                Some(file) if file.is_this_directory() => {}
                Some(file) => list.add_file(file),
                None => debug!("Unparsed listing line: {}", line),
            }
        }
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<RemoteFile, BackendError> {
        let full = self.resolve(path);
        let output = self
            .run(&format!("{} -d {}", LIST_COMMAND, shell_quote(&full)), "Reading file")
            .await?;
        let line = output
            .stdout_lines()
            .into_iter()
            .find(|l| !l.is_empty())
            .ok_or_else(|| BackendError::FileNotFound(full.clone()))?;
        let mut file = parse_listing_line(&line)
            .ok_or_else(|| BackendError::ProtocolError(format!("Unexpected listing: {}", line)))?;
        file.name = unix_extract_file_name(&full);
        file.directory = unix_extract_file_dir(&full);
        Ok(file)
    }

    async fn change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        let target = self.resolve(dir);
        self.change_to(&format!("cd {} && pwd", shell_quote(&target)))
            .await
    }

    async fn cached_change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        self.controller()?;
        self.cwd = unix_exclude_trailing_slash(dir);
        Ok(())
    }

    async fn home_directory(&mut self) -> Result<(), BackendError> {
        self.controller()?;
        self.cwd = self.home.clone();
        Ok(())
    }

    async fn create_directory(&mut self, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(path);
        info!("Creating directory: {}", full);
        self.run(&format!("mkdir {}", shell_quote(&full)), "Creating directory")
            .await?;
        Ok(())
    }

    async fn delete_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        info!("Deleting: {}", full);
        self.run(&format!("rm -f -r {}", shell_quote(&full)), "Deleting")
            .await?;
        Ok(())
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        let command = format!(
            "mv -f {} {}",
            shell_quote(&self.resolve(from)),
            shell_quote(&self.resolve(to))
        );
        self.run(&command, "Renaming").await?;
        Ok(())
    }

    async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        let command = format!(
            "cp -p -R -f {} {}",
            shell_quote(&self.resolve(from)),
            shell_quote(&self.resolve(to))
        );
        self.run(&command, "Copying").await?;
        Ok(())
    }

    async fn change_file_properties(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), BackendError> {
        let full = shell_quote(&self.resolve(path));
        let recursive = if properties.recursive { "-R " } else { "" };
        if let Some(group) = properties.group.as_ref().filter(|g| g.is_set()) {
            let command = format!("chgrp {}{} {}", recursive, shell_quote(&group.display_text()), full);
            self.run(&command, "Changing group").await?;
        }
        if let Some(owner) = properties.owner.as_ref().filter(|o| o.is_set()) {
            let command = format!("chown {}{} {}", recursive, shell_quote(&owner.display_text()), full);
            self.run(&command, "Changing owner").await?;
        }
        if let Some(modes) = properties.modes {
            let command = format!("chmod {}{:o} {}", recursive, modes, full);
            self.run(&command, "Changing permissions").await?;
        }
        if let Some(modification) = properties.modification {
            let command = format!("touch -d @{} {}", modification.timestamp(), full);
            self.run(&command, "Changing timestamp").await?;
        }
        Ok(())
    }

    async fn create_link(
        &mut self,
        path: &str,
        point_to: &str,
        symbolic: bool,
    ) -> Result<(), BackendError> {
        let command = format!(
            "ln {}{} {}",
            if symbolic { "-s " } else { "" },
            shell_quote(point_to),
            shell_quote(&self.resolve(path))
        );
        self.run(&command, "Creating link").await?;
        Ok(())
    }

    async fn any_command(&mut self, command: &str) -> Result<Vec<String>, BackendError> {
        let output = self.exec(&self.in_cwd(command), None).await?;
        if !output.success() && output.stdout.is_empty() {
            output.check("Command")?;
            return Ok(Vec::new());
        }
        let mut lines = output.stdout_lines();
        lines.extend(text_lines(&output.stderr));
        Ok(lines)
    }

    async fn custom_command_on_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        command: &str,
    ) -> Result<Vec<String>, BackendError> {
        let full = shell_quote(&self.resolve(path));
        let command = file_command(command, &full);
        self.any_command(&command).await
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote_path: &str,
        preserve_time: bool,
    ) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        debug!("Uploading {} to {}", local.display(), full);
        let mut content = Vec::new();
        let mut file = tokio::fs::File::open(local).await?;
        file.read_to_end(&mut content).await?;
        let modified = file.metadata().await?.modified()?;

        self.exec(&format!("cat > {}", shell_quote(&full)), Some(&content))
            .await?
            .check("Uploading")?;

        if preserve_time {
            let modification = DateTime::<Utc>::from(modified);
            self.run(
                &format!("touch -d @{} {}", modification.timestamp(), shell_quote(&full)),
                "Preserving timestamp",
            )
            .await?;
        }
        Ok(content.len() as u64)
    }

    async fn download_file(&mut self, remote_path: &str, local: &Path) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        debug!("Downloading {} to {}", full, local.display());
        let output = self
            .exec(&format!("cat {}", shell_quote(&full)), None)
            .await?
            .check("Downloading")?;
        let mut file = tokio::fs::File::create(local).await?;
        file.write_all(&output.stdout).await?;
        file.flush().await?;
        Ok(output.stdout.len() as u64)
    }

    async fn lookup_users_groups(&mut self) -> Result<(), BackendError> {
        let output = self.run("groups", "Looking up groups").await?;
        self.groups = output
            .stdout_lines()
            .iter()
            .flat_map(|l| l.split_whitespace().map(|g| g.to_string()).collect::<Vec<_>>())
            .collect();
        debug!("User groups: {:?}", self.groups);
        Ok(())
    }

    fn is_capable(&self, capability: Capability) -> bool {
        CAPABILITIES.contains(&capability)
    }

    fn file_system_info(&self) -> FileSystemInfo {
        FileSystemInfo {
            protocol_base_name: "SCP".to_string(),
            protocol_name: "SCP".to_string(),
            remote_system: String::new(),
            additional_info: String::new(),
            capabilities: CAPABILITIES.to_vec(),
        }
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            protocol_name: "SCP".to_string(),
            security_protocol_name: "SSH-2".to_string(),
            host_key_fingerprint: self.fingerprint.clone(),
        }
    }

    fn user_name(&self) -> String {
        self.data.user_name.clone()
    }
}
