//! In-memory file system backend
//!
//! Keeps a remote tree in a shared [`MemoryFs`] so the embedder (or a test) can
//! inspect and mutate it while a session is using it. Faults can be injected per
//! operation and path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::error::BackendError;
use super::types::{
    Capability, FileSystemInfo, ModificationPrecision, RemoteFile, RemoteFileList,
    RemoteProperties, SessionInfo, SpaceAvailable,
};
use super::{file_command, BackendFactory, FileSystemBackend};
use crate::config::{Protocol, SessionData};
use crate::path_utils::{join_remote_path, unix_extract_file_name};
use crate::session::SessionCallbacks;

#[derive(Debug, Clone)]
struct MemoryNode {
    is_directory: bool,
    content: Vec<u8>,
    modification: DateTime<Utc>,
    permissions: u32,
    link_target: Option<String>,
}

/// How an injected fault fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Operation error, connection stays up
    Operation,
    /// Connection drops
    ConnectionLost,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: String,
    path: Option<String>,
    kind: FaultKind,
    remaining: u32,
}

/// Shared state of an in-memory remote tree
#[derive(Debug)]
pub struct MemoryFs {
    nodes: BTreeMap<String, MemoryNode>,
    faults: Vec<Fault>,
    precision: ModificationPrecision,
    /// Number of current-directory reads served
    pub read_current_directory_count: usize,
    /// Number of directory listings served
    pub read_directory_count: usize,
    /// Number of successful opens
    pub open_count: usize,
    /// Commands executed through `any_command`/`custom_command_on_file`
    pub commands: Vec<String>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Self::directory_node(Utc::now()));
        Self {
            nodes,
            faults: Vec::new(),
            precision: ModificationPrecision::Full,
            read_current_directory_count: 0,
            read_directory_count: 0,
            open_count: 0,
            commands: Vec::new(),
        }
    }

    /// Wrap into the shared handle backends use
    pub fn shared(self) -> Arc<Mutex<MemoryFs>> {
        Arc::new(Mutex::new(self))
    }

    fn directory_node(modification: DateTime<Utc>) -> MemoryNode {
        MemoryNode {
            is_directory: true,
            content: Vec::new(),
            modification,
            permissions: 0o755,
            link_target: None,
        }
    }

    /// Timestamp precision reported in listings
    pub fn set_precision(&mut self, precision: ModificationPrecision) {
        self.precision = precision;
    }

    /// Create a directory and its missing parents
    pub fn add_directory(&mut self, path: &str) {
        let path = normalize("/", path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = format!("{}/{}", current, part);
            self.nodes
                .entry(current.clone())
                .or_insert_with(|| Self::directory_node(Utc::now()));
        }
    }

    /// Create a file, creating missing parent directories
    pub fn add_file(&mut self, path: &str, content: &[u8], modification: DateTime<Utc>) {
        let path = normalize("/", path);
        self.add_directory(&parent_of(&path));
        self.nodes.insert(
            path,
            MemoryNode {
                is_directory: false,
                content: content.to_vec(),
                modification,
                permissions: 0o644,
                link_target: None,
            },
        );
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize("/", path))
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.nodes
            .get(&normalize("/", path))
            .map(|n| n.is_directory)
            .unwrap_or(false)
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.get(&normalize("/", path)).map(|n| n.content.clone())
    }

    pub fn modification(&self, path: &str) -> Option<DateTime<Utc>> {
        self.nodes.get(&normalize("/", path)).map(|n| n.modification)
    }

    pub fn permissions(&self, path: &str) -> Option<u32> {
        self.nodes.get(&normalize("/", path)).map(|n| n.permissions)
    }

    pub fn set_modification(&mut self, path: &str, modification: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(&normalize("/", path)) {
            node.modification = modification;
        }
    }

    /// Remove a node with everything below it
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize("/", path);
        let prefix = format!("{}/", path);
        let existed = self.nodes.remove(&path).is_some();
        self.nodes.retain(|k, _| !k.starts_with(&prefix));
        existed
    }

    /// Fail the next `times` calls of `operation` (optionally only for `path`)
    pub fn inject_fault(&mut self, operation: &str, path: Option<&str>, kind: FaultKind, times: u32) {
        self.faults.push(Fault {
            operation: operation.to_string(),
            path: path.map(|p| normalize("/", p)),
            kind,
            remaining: times,
        });
    }

    fn take_fault(&mut self, operation: &str, path: &str) -> Option<FaultKind> {
        let fault = self.faults.iter_mut().find(|f| {
            f.remaining > 0
                && f.operation == operation
                && f.path.as_deref().map(|p| p == path).unwrap_or(true)
        })?;
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn children(&self, dir: &str) -> Vec<(String, MemoryNode)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains('/'))
            .map(|(k, n)| (k[prefix.len()..].to_string(), n.clone()))
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<(String, MemoryNode)> {
        let prefix = format!("{}/", path);
        self.nodes
            .iter()
            .filter(|(k, _)| k.as_str() == path || k.starts_with(&prefix))
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect()
    }

    fn to_remote_file(&self, name: &str, node: &MemoryNode) -> RemoteFile {
        let mut file = if node.is_directory {
            RemoteFile::directory(name, node.modification)
        } else {
            RemoteFile::file(name, node.content.len() as u64, node.modification)
        };
        file.modification_precision = self.precision;
        file.permissions = Some(node.permissions);
        file.is_symlink = node.link_target.is_some();
        file.link_target = node.link_target.clone();
        file
    }
}

/// Resolve `path` against `cwd` into a canonical absolute path
fn normalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        join_remote_path(cwd, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

fn default_capabilities() -> Vec<Capability> {
    vec![
        Capability::UserGroupListing,
        Capability::ModeChanging,
        Capability::AnyCommand,
        Capability::SymbolicLink,
        Capability::Rename,
        Capability::RemoteCopy,
        Capability::RemoteMove,
        Capability::TimestampChanging,
        Capability::PreservingTimestampUpload,
        Capability::CheckingSpaceAvailable,
    ]
}

/// Backend over a shared [`MemoryFs`]
pub struct MemoryBackend {
    fs: Arc<Mutex<MemoryFs>>,
    cwd: String,
    home: String,
    user: String,
    active: bool,
    capabilities: Vec<Capability>,
}

impl MemoryBackend {
    pub fn new(fs: Arc<Mutex<MemoryFs>>, home: &str) -> Self {
        Self {
            fs,
            cwd: String::new(),
            home: normalize("/", home),
            user: "memory".to_string(),
            active: false,
            capabilities: default_capabilities(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn base(&self) -> &str {
        if self.cwd.is_empty() {
            &self.home
        } else {
            &self.cwd
        }
    }

    fn resolve(&self, path: &str) -> String {
        normalize(self.base(), path)
    }

    /// Check connection state and injected faults for one operation
    fn enter(&mut self, operation: &str, path: &str) -> Result<(), BackendError> {
        if !self.active {
            return Err(BackendError::NotConnected);
        }
        let fault = self.fs.lock().take_fault(operation, path);
        match fault {
            None => Ok(()),
            Some(FaultKind::Operation) => Err(BackendError::OperationFailed(format!(
                "{} failed for {}",
                operation, path
            ))),
            Some(FaultKind::ConnectionLost) => {
                self.active = false;
                Err(BackendError::ConnectionLost(format!(
                    "connection dropped during {}",
                    operation
                )))
            }
        }
    }
}

#[async_trait]
impl FileSystemBackend for MemoryBackend {
    async fn open(&mut self) -> Result<(), BackendError> {
        let fault = self.fs.lock().take_fault("open", "/");
        match fault {
            Some(FaultKind::Operation) => {
                return Err(BackendError::AuthenticationFailed("access denied".to_string()))
            }
            Some(FaultKind::ConnectionLost) => {
                return Err(BackendError::ConnectionFailed("connection refused".to_string()))
            }
            None => {}
        }
        let mut fs = self.fs.lock();
        fs.open_count += 1;
        if !fs.nodes.contains_key(&self.home) {
            let home = self.home.clone();
            fs.add_directory(&home);
        }
        self.active = true;
        self.cwd.clear();
        debug!("Memory backend opened at {}", self.home);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn idle(&mut self) -> Result<(), BackendError> {
        self.enter("idle", "/")
    }

    fn current_directory(&self) -> String {
        self.cwd.clone()
    }

    async fn read_current_directory(&mut self) -> Result<(), BackendError> {
        let base = self.base().to_string();
        self.enter("read_current_directory", &base)?;
        self.fs.lock().read_current_directory_count += 1;
        self.cwd = base;
        Ok(())
    }

    async fn read_directory(&mut self, list: &mut RemoteFileList) -> Result<(), BackendError> {
        let dir = self.resolve(list.directory());
        self.enter("read_directory", &dir)?;
        let mut fs = self.fs.lock();
        fs.read_directory_count += 1;
        match fs.nodes.get(&dir) {
            Some(node) if node.is_directory => {}
            Some(_) => return Err(BackendError::OperationFailed(format!("{} is not a directory", dir))),
            None => return Err(BackendError::FileNotFound(dir)),
        }
        for (name, node) in fs.children(&dir) {
            let file = fs.to_remote_file(&name, &node);
            list.add_file(file);
        }
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<RemoteFile, BackendError> {
        let full = self.resolve(path);
        self.enter("read_file", &full)?;
        let fs = self.fs.lock();
        let node = fs
            .nodes
            .get(&full)
            .ok_or_else(|| BackendError::FileNotFound(full.clone()))?;
        let mut file = fs.to_remote_file(&unix_extract_file_name(&full), node);
        file.directory = crate::path_utils::unix_extract_file_dir(&full);
        Ok(file)
    }

    async fn change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        let target = self.resolve(dir);
        self.enter("change_directory", &target)?;
        if !self.fs.lock().is_directory(&target) {
            return Err(BackendError::FileNotFound(target));
        }
        self.cwd = target;
        Ok(())
    }

    async fn cached_change_directory(&mut self, dir: &str) -> Result<(), BackendError> {
        self.enter("cached_change_directory", dir)?;
        self.cwd = normalize("/", dir);
        Ok(())
    }

    async fn home_directory(&mut self) -> Result<(), BackendError> {
        let home = self.home.clone();
        self.change_directory(&home).await
    }

    async fn create_directory(&mut self, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(path);
        self.enter("create_directory", &full)?;
        let mut fs = self.fs.lock();
        if fs.nodes.contains_key(&full) {
            return Err(BackendError::AlreadyExists(full));
        }
        if !fs.is_directory(&parent_of(&full)) {
            return Err(BackendError::FileNotFound(parent_of(&full)));
        }
        fs.nodes.insert(full, MemoryFs::directory_node(Utc::now()));
        Ok(())
    }

    async fn delete_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        self.enter("delete_file", &full)?;
        if self.fs.lock().remove(&full) {
            Ok(())
        } else {
            Err(BackendError::FileNotFound(full))
        }
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        self.enter("rename_file", &source)?;
        let mut fs = self.fs.lock();
        if !fs.nodes.contains_key(&source) {
            return Err(BackendError::FileNotFound(source));
        }
        if fs.is_directory(&target) {
            return Err(BackendError::AlreadyExists(target));
        }
        for (path, node) in fs.subtree(&source) {
            fs.nodes.remove(&path);
            fs.nodes
                .insert(format!("{}{}", target, &path[source.len()..]), node);
        }
        Ok(())
    }

    async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        self.enter("copy_file", &source)?;
        let mut fs = self.fs.lock();
        let subtree = fs.subtree(&source);
        if subtree.is_empty() {
            return Err(BackendError::FileNotFound(source));
        }
        for (path, node) in subtree {
            fs.nodes
                .insert(format!("{}{}", target, &path[source.len()..]), node);
        }
        Ok(())
    }

    async fn change_file_properties(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        properties: &RemoteProperties,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        self.enter("change_file_properties", &full)?;
        let mut fs = self.fs.lock();
        let targets: Vec<String> = if properties.recursive {
            fs.subtree(&full).into_iter().map(|(p, _)| p).collect()
        } else {
            vec![full.clone()]
        };
        if !fs.nodes.contains_key(&full) {
            return Err(BackendError::FileNotFound(full));
        }
        for target in targets {
            if let Some(node) = fs.nodes.get_mut(&target) {
                if let Some(modes) = properties.modes {
                    node.permissions = modes;
                }
                if let Some(modification) = properties.modification {
                    node.modification = modification;
                }
            }
        }
        Ok(())
    }

    async fn create_link(
        &mut self,
        path: &str,
        point_to: &str,
        symbolic: bool,
    ) -> Result<(), BackendError> {
        let full = self.resolve(path);
        self.enter("create_link", &full)?;
        let mut fs = self.fs.lock();
        if fs.nodes.contains_key(&full) {
            return Err(BackendError::AlreadyExists(full));
        }
        let mut node = fs
            .nodes
            .get(&self.resolve(point_to))
            .cloned()
            .unwrap_or(MemoryNode {
                is_directory: false,
                content: Vec::new(),
                modification: Utc::now(),
                permissions: 0o777,
                link_target: None,
            });
        if symbolic {
            node.link_target = Some(point_to.to_string());
        }
        fs.nodes.insert(full, node);
        Ok(())
    }

    async fn any_command(&mut self, command: &str) -> Result<Vec<String>, BackendError> {
        let cwd = self.base().to_string();
        self.enter("any_command", &cwd)?;
        self.fs.lock().commands.push(command.to_string());
        Ok(Vec::new())
    }

    async fn custom_command_on_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        command: &str,
    ) -> Result<Vec<String>, BackendError> {
        let full = self.resolve(path);
        self.enter("custom_command_on_file", &full)?;
        self.fs.lock().commands.push(file_command(command, &full));
        Ok(Vec::new())
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote_path: &str,
        preserve_time: bool,
    ) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        self.enter("upload_file", &full)?;
        let content = std::fs::read(local)?;
        let modification = if preserve_time {
            DateTime::<Utc>::from(std::fs::metadata(local)?.modified()?)
        } else {
            Utc::now()
        };
        let mut fs = self.fs.lock();
        if !fs.is_directory(&parent_of(&full)) {
            return Err(BackendError::FileNotFound(parent_of(&full)));
        }
        let size = content.len() as u64;
        fs.nodes.insert(
            full,
            MemoryNode {
                is_directory: false,
                content,
                modification,
                permissions: 0o644,
                link_target: None,
            },
        );
        Ok(size)
    }

    async fn download_file(&mut self, remote_path: &str, local: &Path) -> Result<u64, BackendError> {
        let full = self.resolve(remote_path);
        self.enter("download_file", &full)?;
        let content = {
            let fs = self.fs.lock();
            match fs.nodes.get(&full) {
                Some(node) if !node.is_directory => node.content.clone(),
                Some(_) => {
                    return Err(BackendError::OperationFailed(format!("{} is a directory", full)))
                }
                None => return Err(BackendError::FileNotFound(full)),
            }
        };
        std::fs::write(local, &content)?;
        Ok(content.len() as u64)
    }

    async fn space_available(&mut self, path: &str) -> Result<SpaceAvailable, BackendError> {
        let full = self.resolve(path);
        self.enter("space_available", &full)?;
        let used: u64 = self
            .fs
            .lock()
            .nodes
            .values()
            .map(|n| n.content.len() as u64)
            .sum();
        let total = 1u64 << 30;
        Ok(SpaceAvailable {
            bytes_on_device: total,
            unused_bytes_on_device: total.saturating_sub(used),
            bytes_available_to_user: total.saturating_sub(used),
            bytes_per_allocation_unit: 4096,
        })
    }

    fn is_capable(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn file_system_info(&self) -> FileSystemInfo {
        FileSystemInfo {
            protocol_base_name: "Memory".to_string(),
            protocol_name: "Memory".to_string(),
            remote_system: "in-process".to_string(),
            additional_info: String::new(),
            capabilities: self.capabilities.clone(),
        }
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            protocol_name: "Memory".to_string(),
            security_protocol_name: String::new(),
            host_key_fingerprint: None,
        }
    }

    fn user_name(&self) -> String {
        self.user.clone()
    }
}

/// Factory handing out backends over one shared tree
#[derive(Clone)]
pub struct MemoryBackendFactory {
    fs: Arc<Mutex<MemoryFs>>,
    home: String,
    capabilities: Vec<Capability>,
}

impl MemoryBackendFactory {
    pub fn new(fs: Arc<Mutex<MemoryFs>>, home: &str) -> Self {
        Self {
            fs,
            home: home.to_string(),
            capabilities: default_capabilities(),
        }
    }

    /// Capabilities of the main backend; SCP-only backends always run commands
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn fs(&self) -> Arc<Mutex<MemoryFs>> {
        self.fs.clone()
    }
}

impl BackendFactory for MemoryBackendFactory {
    fn create(
        &self,
        protocol: Protocol,
        _data: &SessionData,
        _callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<Box<dyn FileSystemBackend>, BackendError> {
        let capabilities = if protocol == Protocol::ScpOnly {
            let mut caps = self.capabilities.clone();
            if !caps.contains(&Capability::AnyCommand) {
                caps.push(Capability::AnyCommand);
            }
            caps
        } else {
            self.capabilities.clone()
        };
        Ok(Box::new(
            MemoryBackend::new(self.fs.clone(), &self.home).with_capabilities(capabilities),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn opened(fs: &Arc<Mutex<MemoryFs>>) -> MemoryBackend {
        let mut backend = MemoryBackend::new(fs.clone(), "/home/user");
        backend.open().await.unwrap();
        backend.read_current_directory().await.unwrap();
        backend
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/home/user", "a/../b"), "/home/user/b");
        assert_eq!(normalize("/home/user", "/etc/./x"), "/etc/x");
        assert_eq!(normalize("/", ".."), "/");
    }

    #[tokio::test]
    async fn test_listing_and_counters() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"hello", Utc::now());
        fs.lock().add_directory("/home/user/sub");
        let mut backend = opened(&fs).await;
        assert_eq!(backend.current_directory(), "/home/user");

        let mut list = RemoteFileList::new("/home/user");
        backend.read_directory(&mut list).await.unwrap();
        assert_eq!(list.count(), 2);
        let a = list.find_file("a.txt").unwrap();
        assert_eq!(a.size, 5);
        assert!(list.find_file("sub").unwrap().is_directory);

        assert_eq!(fs.lock().read_directory_count, 1);
        assert_eq!(fs.lock().read_current_directory_count, 1);
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/d/x.txt", b"x", Utc::now());
        let mut backend = opened(&fs).await;
        backend.rename_file("d", "/home/user/e").await.unwrap();
        assert!(fs.lock().exists("/home/user/e/x.txt"));
        assert!(!fs.lock().exists("/home/user/d"));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"a", Utc::now());
        let mut backend = opened(&fs).await;

        fs.lock()
            .inject_fault("delete_file", Some("/home/user/a.txt"), FaultKind::Operation, 1);
        assert!(backend.delete_file("a.txt", None).await.is_err());
        assert!(backend.is_active());
        backend.delete_file("a.txt", None).await.unwrap();

        fs.lock().inject_fault("idle", None, FaultKind::ConnectionLost, 1);
        let err = backend.idle().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!backend.is_active());
    }

    #[tokio::test]
    async fn test_upload_download() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.txt");
        std::fs::write(&local, b"payload").unwrap();

        let fs = MemoryFs::new().shared();
        let mut backend = opened(&fs).await;
        let written = backend.upload_file(&local, "up.txt", true).await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(fs.lock().content("/home/user/up.txt").unwrap(), b"payload");

        let back = dir.path().join("down.txt");
        backend.download_file("up.txt", &back).await.unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"payload");
    }
}
