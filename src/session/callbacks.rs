//! UI callbacks
//!
//! The session talks to its user interface only through [`SessionCallbacks`].
//! Callbacks are synchronous and may be called from any task driving the session.
//! A callback returning a fatal error is caught by the session's callback guard.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::SessionError;
use super::progress::{FinishedEvent, OperationProgress};

/// Set of query buttons
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueryAnswers(u32);

impl QueryAnswers {
    pub const NONE: Self = Self(0);
    pub const YES: Self = Self(0x0001);
    pub const NO: Self = Self(0x0004);
    pub const OK: Self = Self(0x0008);
    pub const CANCEL: Self = Self(0x0010);
    pub const ABORT: Self = Self(0x0020);
    pub const RETRY: Self = Self(0x0040);
    pub const IGNORE: Self = Self(0x0080);
    pub const ALL: Self = Self(0x0100);
    pub const NO_TO_ALL: Self = Self(0x0200);
    pub const YES_TO_ALL: Self = Self(0x0400);
    pub const HELP: Self = Self(0x0800);
    pub const SKIP: Self = Self(0x1000);
    pub const NEVER_ASK_AGAIN: Self = Self(0x8000);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// The answer meaning "stop" among these buttons
    pub fn abort_answer(self) -> Self {
        [Self::ABORT, Self::CANCEL, Self::NO, Self::OK]
            .into_iter()
            .find(|a| self.contains(*a))
            .unwrap_or(Self::ABORT)
    }

    /// The answer meaning "go on" among these buttons
    pub fn continue_answer(self) -> Self {
        [Self::OK, Self::YES, Self::RETRY, Self::IGNORE, Self::SKIP]
            .into_iter()
            .find(|a| self.contains(*a))
            .unwrap_or(Self::OK)
    }
}

impl BitOr for QueryAnswers {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryAnswers {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for QueryAnswers {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for QueryAnswers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(QueryAnswers, &str); 13] = [
            (QueryAnswers::YES, "Yes"),
            (QueryAnswers::NO, "No"),
            (QueryAnswers::OK, "Ok"),
            (QueryAnswers::CANCEL, "Cancel"),
            (QueryAnswers::ABORT, "Abort"),
            (QueryAnswers::RETRY, "Retry"),
            (QueryAnswers::IGNORE, "Ignore"),
            (QueryAnswers::ALL, "All"),
            (QueryAnswers::NO_TO_ALL, "NoToAll"),
            (QueryAnswers::YES_TO_ALL, "YesToAll"),
            (QueryAnswers::HELP, "Help"),
            (QueryAnswers::SKIP, "Skip"),
            (QueryAnswers::NEVER_ASK_AGAIN, "NeverAskAgain"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(a, _)| self.contains(*a))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "QueryAnswers({})", names.join("|"))
    }
}

/// Caption override for one button
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryButtonAlias {
    pub button: QueryAnswers,
    pub alias: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub aliases: Vec<QueryButtonAlias>,
    /// Answer automatically after this long
    pub timeout: Option<Duration>,
    pub timeout_answer: Option<QueryAnswers>,
    /// Offer a "never ask again" check box
    pub never_ask_again_check: bool,
    pub allow_continue_on_error: bool,
}

impl QueryParams {
    pub fn with_alias(mut self, button: QueryAnswers, alias: impl Into<String>) -> Self {
        self.aliases.push(QueryButtonAlias {
            button,
            alias: alias.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, answer: QueryAnswers) -> Self {
        self.timeout = Some(timeout);
        self.timeout_answer = Some(answer);
        self
    }

    pub fn alias(&self, button: QueryAnswers) -> Option<&str> {
        self.aliases
            .iter()
            .find(|a| a.button == button)
            .map(|a| a.alias.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptKind {
    Password,
    Passphrase,
    KeyboardInteractive,
    Username,
    Text,
}

impl PromptKind {
    pub fn is_secret(self) -> bool {
        matches!(
            self,
            PromptKind::Password | PromptKind::Passphrase | PromptKind::KeyboardInteractive
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    /// Show what is typed
    pub echo: bool,
}

/// User interface of a session
///
/// Every method has a non-interactive default, so implementors only override
/// what their UI shows.
pub trait SessionCallbacks: Send + Sync {
    /// Status line text; `status` marks connection status messages
    fn information(&self, _text: &str, _status: bool) -> Result<(), SessionError> {
        Ok(())
    }

    /// Ask a question, returning one of `answers`
    fn query_user(
        &self,
        _query: &str,
        _more_messages: &[String],
        answers: QueryAnswers,
        params: &QueryParams,
    ) -> Result<QueryAnswers, SessionError> {
        match params.timeout_answer {
            Some(answer) if answers.contains(answer) => Ok(answer),
            _ => Ok(answers.abort_answer()),
        }
    }

    /// Ask for values; `None` means the user cancelled
    fn prompt_user(
        &self,
        _kind: PromptKind,
        _name: &str,
        _instructions: &str,
        _prompts: &[Prompt],
    ) -> Result<Option<Vec<String>>, SessionError> {
        Ok(None)
    }

    fn display_banner(&self, _banner: &str) -> Result<(), SessionError> {
        Ok(())
    }

    /// Called when an operation starts, per file and when it stops.
    /// Setting `progress.cancel` stops the operation.
    fn progress(&self, _progress: &mut OperationProgress) -> Result<(), SessionError> {
        Ok(())
    }

    fn finished(&self, _event: &mut FinishedEvent) -> Result<(), SessionError> {
        Ok(())
    }

    fn change_directory(&self, _directory: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn start_read_directory(&self, _directory: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn read_directory(&self, _directory: &str, _reload_only: bool) -> Result<(), SessionError> {
        Ok(())
    }

    /// Report an error nobody will be asked about
    fn show_extended_exception(&self, _error: &SessionError) -> Result<(), SessionError> {
        Ok(())
    }

    fn closed(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Callbacks that never interact
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallbacks;

impl SessionCallbacks for NullCallbacks {}

/// Forwards to the UI while remembering typed secrets
///
/// A secondary session is given its parent's password and tries it once before
/// bothering the user. Banners, directory and close notifications are shown only
/// by the primary session.
pub struct RememberingCallbacks {
    inner: Arc<dyn SessionCallbacks>,
    remembered: Mutex<Option<String>>,
    parent_password: Option<String>,
    parent_password_tried: AtomicBool,
    secondary: bool,
}

impl RememberingCallbacks {
    pub fn new(inner: Arc<dyn SessionCallbacks>) -> Self {
        Self {
            inner,
            remembered: Mutex::new(None),
            parent_password: None,
            parent_password_tried: AtomicBool::new(false),
            secondary: false,
        }
    }

    pub fn secondary(inner: Arc<dyn SessionCallbacks>, parent_password: Option<String>) -> Self {
        Self {
            parent_password,
            secondary: true,
            ..Self::new(inner)
        }
    }

    pub fn inner(&self) -> Arc<dyn SessionCallbacks> {
        self.inner.clone()
    }

    /// Last secret the user typed
    pub fn remembered_password(&self) -> Option<String> {
        self.remembered.lock().clone()
    }
}

impl SessionCallbacks for RememberingCallbacks {
    fn information(&self, text: &str, status: bool) -> Result<(), SessionError> {
        self.inner.information(text, status)
    }

    fn query_user(
        &self,
        query: &str,
        more_messages: &[String],
        answers: QueryAnswers,
        params: &QueryParams,
    ) -> Result<QueryAnswers, SessionError> {
        self.inner.query_user(query, more_messages, answers, params)
    }

    fn prompt_user(
        &self,
        kind: PromptKind,
        name: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Option<Vec<String>>, SessionError> {
        if kind == PromptKind::Password && prompts.len() == 1 {
            if let Some(password) = &self.parent_password {
                if !self.parent_password_tried.swap(true, Ordering::SeqCst) {
                    debug!("Using the parent session's password for {}", name);
                    return Ok(Some(vec![password.clone()]));
                }
            }
        }
        let result = self.inner.prompt_user(kind, name, instructions, prompts)?;
        if kind.is_secret() {
            if let Some(first) = result.as_ref().and_then(|r| r.first()) {
                *self.remembered.lock() = Some(first.clone());
            }
        }
        Ok(result)
    }

    fn display_banner(&self, banner: &str) -> Result<(), SessionError> {
        if self.secondary {
            return Ok(());
        }
        self.inner.display_banner(banner)
    }

    fn progress(&self, progress: &mut OperationProgress) -> Result<(), SessionError> {
        self.inner.progress(progress)
    }

    fn finished(&self, event: &mut FinishedEvent) -> Result<(), SessionError> {
        self.inner.finished(event)
    }

    fn change_directory(&self, directory: &str) -> Result<(), SessionError> {
        if self.secondary {
            return Ok(());
        }
        self.inner.change_directory(directory)
    }

    fn start_read_directory(&self, directory: &str) -> Result<(), SessionError> {
        if self.secondary {
            return Ok(());
        }
        self.inner.start_read_directory(directory)
    }

    fn read_directory(&self, directory: &str, reload_only: bool) -> Result<(), SessionError> {
        if self.secondary {
            return Ok(());
        }
        self.inner.read_directory(directory, reload_only)
    }

    fn show_extended_exception(&self, error: &SessionError) -> Result<(), SessionError> {
        self.inner.show_extended_exception(error)
    }

    fn closed(&self) -> Result<(), SessionError> {
        if self.secondary {
            return Ok(());
        }
        self.inner.closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingPrompts {
        asked: Mutex<usize>,
    }

    impl SessionCallbacks for CountingPrompts {
        fn prompt_user(
            &self,
            _kind: PromptKind,
            _name: &str,
            _instructions: &str,
            _prompts: &[Prompt],
        ) -> Result<Option<Vec<String>>, SessionError> {
            *self.asked.lock() += 1;
            Ok(Some(vec!["typed".to_string()]))
        }

        fn display_banner(&self, _banner: &str) -> Result<(), SessionError> {
            Err(SessionError::fatal("banner shown"))
        }
    }

    fn password_prompt() -> Vec<Prompt> {
        vec![Prompt {
            text: "Password: ".to_string(),
            echo: false,
        }]
    }

    #[test]
    fn test_answers() {
        let answers = QueryAnswers::RETRY | QueryAnswers::SKIP | QueryAnswers::ABORT;
        assert!(answers.contains(QueryAnswers::SKIP));
        assert!(!answers.contains(QueryAnswers::ALL));
        assert!(!answers.contains(QueryAnswers::NONE));
        assert_eq!(answers.abort_answer(), QueryAnswers::ABORT);
        assert_eq!((QueryAnswers::YES | QueryAnswers::NO).abort_answer(), QueryAnswers::NO);
        assert_eq!(QueryAnswers::OK.abort_answer(), QueryAnswers::OK);
        assert_eq!(format!("{:?}", QueryAnswers::YES | QueryAnswers::NO), "QueryAnswers(Yes|No)");
    }

    #[test]
    fn test_null_callbacks_use_timeout_answer() {
        let params = QueryParams::default().with_timeout(Duration::from_secs(1), QueryAnswers::RETRY);
        let answer = NullCallbacks
            .query_user("q", &[], QueryAnswers::RETRY | QueryAnswers::ABORT, &params)
            .unwrap();
        assert_eq!(answer, QueryAnswers::RETRY);
        let answer = NullCallbacks
            .query_user("q", &[], QueryAnswers::YES | QueryAnswers::NO, &params)
            .unwrap();
        assert_eq!(answer, QueryAnswers::NO);
    }

    #[test]
    fn test_secondary_tries_parent_password_once() {
        let ui = Arc::new(CountingPrompts {
            asked: Mutex::new(0),
        });
        let callbacks = RememberingCallbacks::secondary(ui.clone(), Some("parent".to_string()));
        let first = callbacks
            .prompt_user(PromptKind::Password, "u@h", "", &password_prompt())
            .unwrap();
        assert_eq!(first, Some(vec!["parent".to_string()]));
        assert_eq!(*ui.asked.lock(), 0);

        let second = callbacks
            .prompt_user(PromptKind::Password, "u@h", "", &password_prompt())
            .unwrap();
        assert_eq!(second, Some(vec!["typed".to_string()]));
        assert_eq!(*ui.asked.lock(), 1);
        assert_eq!(callbacks.remembered_password().as_deref(), Some("typed"));

        // banners belong to the primary session
        assert!(callbacks.display_banner("welcome").is_ok());
        assert!(RememberingCallbacks::new(ui).display_banner("welcome").is_err());
    }
}
