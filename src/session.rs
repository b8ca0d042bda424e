use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{SuggestionSettings, Task};
use crate::{AssistantError, Result};

/// Button caption for a suggestion; whitespace-only suggestions get a visible name
pub fn suggestion_label(suggestion: &str) -> String {
    match suggestion {
        "\n" => "<newline>".to_string(),
        " " => "<space>".to_string(),
        other => other.to_string(),
    }
}

/// Latest rewrite produced for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub task: Task,
    pub text: String,
}

/// What the user wants to take over into the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Accept {
    /// Replace the text with the last rewrite
    Transform,
    /// Append one of the shown suggestions
    Suggestion { index: usize },
}

/// Transient UI state of one visitor
#[derive(Debug, Clone)]
pub struct SessionState {
    pub text: String,
    /// Bumped on every submission that invalidates shown output
    pub revision: u64,
    pub visits: u32,
    pub suggestions_enabled: bool,
    pub last_suggestions: Option<Vec<String>>,
    pub last_transform: Option<TransformOutput>,
    pub suggestion_settings: SuggestionSettings,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            revision: 0,
            visits: 1,
            suggestions_enabled: true,
            last_suggestions: None,
            last_transform: None,
            suggestion_settings: SuggestionSettings::default(),
            updated_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Replace the editor text, dropping output computed for the old text
    fn set_text(&mut self, text: String) {
        self.text = text;
        self.revision += 1;
        self.suggestions_enabled = true;
        self.last_suggestions = None;
        self.last_transform = None;
    }

    /// Record text/settings for a suggestion request and return the revision
    /// the result must be stored under.
    ///
    /// Unchanged input keeps the current revision, so an in-flight rewrite of
    /// the same text stays valid.
    pub fn submit_for_suggestions(&mut self, text: &str, settings: SuggestionSettings) -> u64 {
        self.touch();
        if text != self.text {
            self.set_text(text.to_string());
        }
        if settings != self.suggestion_settings {
            self.suggestion_settings = settings;
            self.revision += 1;
            self.suggestions_enabled = true;
            self.last_suggestions = None;
            self.last_transform = None;
        }
        self.revision
    }

    /// Record a rewrite request; always a new submission
    pub fn submit_for_transform(&mut self, text: &str) -> u64 {
        self.touch();
        if text != self.text {
            self.set_text(text.to_string());
        } else {
            self.revision += 1;
            self.last_transform = None;
        }
        self.revision
    }

    /// Keep suggestions only if they belong to the current revision
    pub fn store_suggestions(&mut self, revision: u64, suggestions: Vec<String>) -> bool {
        if revision != self.revision {
            log::debug!("Dropping stale suggestions (rev {} < {})", revision, self.revision);
            return false;
        }
        self.last_suggestions = Some(suggestions);
        true
    }

    /// Keep a rewrite only if it belongs to the current revision.
    ///
    /// A shown rewrite pauses suggestions until the text changes.
    pub fn store_transform(&mut self, revision: u64, output: TransformOutput) -> bool {
        if revision != self.revision {
            log::debug!("Dropping stale rewrite (rev {} < {})", revision, self.revision);
            return false;
        }
        if !output.text.is_empty() {
            self.suggestions_enabled = false;
            self.last_transform = Some(output);
        }
        true
    }

    /// Apply an accept action and return the new revision
    pub fn accept(&mut self, accept: Accept) -> Result<u64> {
        let text = match accept {
            Accept::Transform => self
                .last_transform
                .as_ref()
                .map(|output| output.text.clone())
                .ok_or_else(|| AssistantError::NothingToAccept("no rewrite to apply".to_string()))?,
            Accept::Suggestion { index } => {
                let suggestion = self
                    .last_suggestions
                    .as_ref()
                    .and_then(|suggestions| suggestions.get(index))
                    .ok_or_else(|| {
                        AssistantError::NothingToAccept(format!("no suggestion at index {}", index))
                    })?;
                format!("{}{}", self.text, suggestion)
            }
        };

        self.touch();
        self.set_text(text);
        Ok(self.revision)
    }

    pub fn view(&self, id: &str, transform_available: bool) -> SessionView {
        SessionView {
            id: id.to_string(),
            text: self.text.clone(),
            revision: self.revision,
            suggestions: self.last_suggestions.as_ref().map(|suggestions| {
                suggestions
                    .iter()
                    .map(|text| SuggestionView {
                        text: text.clone(),
                        label: suggestion_label(text),
                    })
                    .collect()
            }),
            transform: self.last_transform.clone(),
            suggestions_enabled: self.suggestions_enabled,
            suggestion_settings: self.suggestion_settings,
            gpu_notice: self.visits == 1 && !transform_available,
        }
    }
}

/// One suggestion button
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionView {
    pub text: String,
    pub label: String,
}

/// JSON shape of a session sent to the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub text: String,
    pub revision: u64,
    pub suggestions: Option<Vec<SuggestionView>>,
    pub transform: Option<TransformOutput>,
    pub suggestions_enabled: bool,
    pub suggestion_settings: SuggestionSettings,
    pub gpu_notice: bool,
}

/// All live sessions, keyed by random id
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
    initial_text: String,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(initial_text: &str, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            initial_text: initial_text.to_string(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionState>> {
        // Session state stays consistent even if a holder panicked
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a session with the default text
    pub fn create(&self) -> (String, SessionState) {
        let pruned = self.prune_at(Utc::now());
        if pruned > 0 {
            log::info!("Pruned {} idle session(s)", pruned);
        }

        let id = format!("{:032x}", rand::random::<u128>());
        let state = SessionState::new(&self.initial_text);
        self.lock().insert(id.clone(), state.clone());
        log::debug!("Created session {}", id);
        (id, state)
    }

    /// Run `f` on a session's state under the store lock
    pub fn with_session<R>(&self, id: &str, f: impl FnOnce(&mut SessionState) -> R) -> Result<R> {
        let mut sessions = self.lock();
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| AssistantError::SessionNotFound(id.to_string()))?;
        Ok(f(state))
    }

    /// Drop sessions idle for longer than the TTL; returns how many were removed
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, state| {
            (now - state.updated_at)
                .to_std()
                .map(|idle| idle <= ttl)
                .unwrap_or(true)
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
