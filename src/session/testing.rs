//! Test fixtures: scripted UI and sessions over the memory backend

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    FinishedEvent, OnceDoneOperation, OperationProgress, QueryAnswers, QueryParams, Session,
    SessionCallbacks, SessionError,
};
use crate::backend::{Capability, MemoryBackendFactory, MemoryFs};
use crate::config::{EngineConfig, SessionData};

pub(crate) const HOME: &str = "/home/user";

type ProgressHook = Box<dyn Fn(&mut OperationProgress) -> Result<(), SessionError> + Send + Sync>;

#[derive(Default)]
struct Recorded {
    answers: VecDeque<QueryAnswers>,
    queries: Vec<String>,
    change_directories: Vec<String>,
    finished: Vec<(String, bool)>,
    progress_calls: usize,
    progress_stops: usize,
    closed: usize,
    extended: Vec<String>,
    information_fatal: bool,
    once_done: Option<OnceDoneOperation>,
}

/// UI answering queries from a queue and recording everything it is told
#[derive(Default)]
pub(crate) struct ScriptedCallbacks {
    state: Mutex<Recorded>,
    progress_hook: Mutex<Option<ProgressHook>>,
}

impl ScriptedCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_answers(&self, answers: &[QueryAnswers]) {
        self.state.lock().answers.extend(answers.iter().copied());
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    pub fn change_directories(&self) -> Vec<String> {
        self.state.lock().change_directories.clone()
    }

    pub fn finished(&self) -> Vec<(String, bool)> {
        self.state.lock().finished.clone()
    }

    pub fn progress_calls(&self) -> usize {
        self.state.lock().progress_calls
    }

    /// Progress notifications seen after the operation stopped
    pub fn progress_stops(&self) -> usize {
        self.state.lock().progress_stops
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().closed
    }

    pub fn extended_exceptions(&self) -> Vec<String> {
        self.state.lock().extended.clone()
    }

    pub fn fail_information_with_fatal(&self, fail: bool) {
        self.state.lock().information_fatal = fail;
    }

    pub fn set_once_done(&self, operation: OnceDoneOperation) {
        self.state.lock().once_done = Some(operation);
    }

    pub fn on_progress(
        &self,
        hook: impl Fn(&mut OperationProgress) -> Result<(), SessionError> + Send + Sync + 'static,
    ) {
        *self.progress_hook.lock() = Some(Box::new(hook));
    }
}

impl SessionCallbacks for ScriptedCallbacks {
    fn information(&self, _text: &str, _status: bool) -> Result<(), SessionError> {
        if self.state.lock().information_fatal {
            return Err(SessionError::fatal("information failed"));
        }
        Ok(())
    }

    fn query_user(
        &self,
        query: &str,
        _more_messages: &[String],
        answers: QueryAnswers,
        params: &QueryParams,
    ) -> Result<QueryAnswers, SessionError> {
        let mut state = self.state.lock();
        state.queries.push(query.to_string());
        if let Some(answer) = state.answers.pop_front() {
            return Ok(answer);
        }
        match params.timeout_answer {
            Some(answer) if answers.contains(answer) => Ok(answer),
            _ => Ok(answers.abort_answer()),
        }
    }

    fn progress(&self, progress: &mut OperationProgress) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            state.progress_calls += 1;
            if !progress.in_progress {
                state.progress_stops += 1;
            }
        }
        match self.progress_hook.lock().as_ref() {
            Some(hook) => hook(progress),
            None => Ok(()),
        }
    }

    fn finished(&self, event: &mut FinishedEvent) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.finished.push((event.file_name.clone(), event.success));
        if let Some(once_done) = state.once_done {
            event.once_done = once_done;
        }
        Ok(())
    }

    fn change_directory(&self, directory: &str) -> Result<(), SessionError> {
        self.state.lock().change_directories.push(directory.to_string());
        Ok(())
    }

    fn show_extended_exception(&self, error: &SessionError) -> Result<(), SessionError> {
        self.state.lock().extended.push(error.to_string());
        Ok(())
    }

    fn closed(&self) -> Result<(), SessionError> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig::default().with_reopen_policy(0, 5, 0)
}

pub(crate) fn test_session_data() -> SessionData {
    SessionData {
        host_name: "memory".to_string(),
        user_name: "user".to_string(),
        ..Default::default()
    }
}

/// Session over `fs` with home directory `/home/user`
pub(crate) fn memory_session(fs: &Arc<Mutex<MemoryFs>>, ui: Arc<ScriptedCallbacks>) -> Session {
    memory_session_with(fs, ui, test_session_data(), test_config())
}

pub(crate) fn memory_session_with(
    fs: &Arc<Mutex<MemoryFs>>,
    ui: Arc<ScriptedCallbacks>,
    data: SessionData,
    config: EngineConfig,
) -> Session {
    let factory = Arc::new(MemoryBackendFactory::new(fs.clone(), HOME));
    Session::new(data, Arc::new(config), ui, factory)
}

/// Session whose main backend only has `capabilities`
pub(crate) fn limited_memory_session(
    fs: &Arc<Mutex<MemoryFs>>,
    ui: Arc<ScriptedCallbacks>,
    capabilities: Vec<Capability>,
) -> Session {
    let factory =
        Arc::new(MemoryBackendFactory::new(fs.clone(), HOME).with_capabilities(capabilities));
    Session::new(test_session_data(), Arc::new(test_config()), ui, factory)
}
