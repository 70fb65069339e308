//! Fixtures for synchronization tests

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::backend::MemoryFs;
use crate::session::testing::{memory_session, ScriptedCallbacks};
use crate::session::Session;

pub(crate) fn hour() -> Duration {
    Duration::hours(1)
}

/// Write a local file and set its modification time
pub(crate) fn local_file(directory: &Path, name: &str, content: &[u8], modification: DateTime<Utc>) {
    let path = directory.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::from(modification))
        .unwrap();
}

pub(crate) fn local_modification(path: &Path) -> DateTime<Utc> {
    DateTime::<Utc>::from(std::fs::metadata(path).unwrap().modified().unwrap())
}

/// Opened session over `fs`
pub(crate) async fn remote_session(fs: &Arc<Mutex<MemoryFs>>, ui: Arc<ScriptedCallbacks>) -> Session {
    let mut session = memory_session(fs, ui);
    session.open().await.unwrap();
    session
}
