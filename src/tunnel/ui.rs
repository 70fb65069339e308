//! Tunnel UI adapter
//!
//! The tunnel connection talks to the user through the session's callbacks, but
//! its keepalive pump runs on a thread of its own. Calls made from the pump
//! thread never reach the UI: queries answer with the abort answer, prompts are
//! cancelled and notifications are dropped.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::debug;

use crate::session::{
    Prompt, PromptKind, QueryAnswers, QueryParams, SessionCallbacks, SessionError,
};

pub struct TunnelUi {
    inner: Arc<dyn SessionCallbacks>,
    pump_thread: Mutex<Option<ThreadId>>,
}

impl TunnelUi {
    pub fn new(inner: Arc<dyn SessionCallbacks>) -> Self {
        Self {
            inner,
            pump_thread: Mutex::new(None),
        }
    }

    /// Register the keepalive pump thread
    pub fn set_pump_thread(&self, id: ThreadId) {
        *self.pump_thread.lock() = Some(id);
    }

    fn on_pump_thread(&self) -> bool {
        *self.pump_thread.lock() == Some(thread::current().id())
    }
}

/// A failing UI takes the tunnel down
fn to_fatal(error: SessionError) -> SessionError {
    if error.is_fatal() || error.is_abort() {
        error
    } else {
        SessionError::fatal(error.to_string())
    }
}

impl SessionCallbacks for TunnelUi {
    fn information(&self, text: &str, status: bool) -> Result<(), SessionError> {
        if self.on_pump_thread() {
            debug!("Tunnel information dropped: {}", text);
            return Ok(());
        }
        self.inner.information(text, status).map_err(to_fatal)
    }

    fn query_user(
        &self,
        query: &str,
        more_messages: &[String],
        answers: QueryAnswers,
        params: &QueryParams,
    ) -> Result<QueryAnswers, SessionError> {
        if self.on_pump_thread() {
            debug!("Tunnel query answered with abort: {}", query);
            return Ok(answers.abort_answer());
        }
        self.inner
            .query_user(query, more_messages, answers, params)
            .map_err(to_fatal)
    }

    fn prompt_user(
        &self,
        kind: PromptKind,
        name: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Option<Vec<String>>, SessionError> {
        if self.on_pump_thread() {
            return Ok(None);
        }
        self.inner
            .prompt_user(kind, name, instructions, prompts)
            .map_err(to_fatal)
    }

    fn display_banner(&self, banner: &str) -> Result<(), SessionError> {
        if self.on_pump_thread() {
            return Ok(());
        }
        self.inner.display_banner(banner).map_err(to_fatal)
    }

    fn show_extended_exception(&self, error: &SessionError) -> Result<(), SessionError> {
        if self.on_pump_thread() {
            return Ok(());
        }
        self.inner.show_extended_exception(error).map_err(to_fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedCallbacks;

    #[test]
    fn test_session_thread_reaches_ui() {
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::YES]);
        let adapter = TunnelUi::new(ui.clone());
        let answer = adapter
            .query_user("Accept key?", &[], QueryAnswers::YES | QueryAnswers::NO, &QueryParams::default())
            .unwrap();
        assert_eq!(answer, QueryAnswers::YES);
        assert_eq!(ui.queries().len(), 1);
    }

    #[test]
    fn test_pump_thread_never_reaches_ui() {
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::YES]);
        let adapter = Arc::new(TunnelUi::new(ui.clone()));

        let pump = {
            let adapter = adapter.clone();
            thread::spawn(move || {
                adapter.set_pump_thread(thread::current().id());
                let answer = adapter
                    .query_user("Accept key?", &[], QueryAnswers::YES | QueryAnswers::NO, &QueryParams::default())
                    .unwrap();
                let prompted = adapter
                    .prompt_user(PromptKind::Password, "tunnel", "", &[])
                    .unwrap();
                adapter.information("lost", false).unwrap();
                (answer, prompted)
            })
        };
        let (answer, prompted) = pump.join().unwrap();
        assert_eq!(answer, QueryAnswers::NO);
        assert!(prompted.is_none());
        assert!(ui.queries().is_empty());
    }

    #[test]
    fn test_ui_errors_become_fatal() {
        let ui = ScriptedCallbacks::new();
        ui.fail_information_with_fatal(true);
        let adapter = TunnelUi::new(ui);
        let err = adapter.information("Opening tunnel", true).unwrap_err();
        assert!(err.is_fatal());
    }
}
