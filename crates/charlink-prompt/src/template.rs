//! The instruction template that opens every prompt.
//!
//! A [`SystemInstructionTemplate`] is a cheap, cloneable handle onto one
//! shared value.  Any number of readers may call [`get`] concurrently while
//! an administrative writer replaces the text with [`set`].  Writes replace
//! the whole value and are serialised, so the last writer wins and a read
//! that starts after a completed write always sees it.
//!
//! The value is never blank: [`set`] rejects blank input and leaves the
//! previous template in effect.
//!
//! [`get`]: SystemInstructionTemplate::get
//! [`set`]: SystemInstructionTemplate::set

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::PromptError;

/// Built-in template, compiled from `assets/system_instruction.txt`.
pub const DEFAULT_TEMPLATE: &str = include_str!("../assets/system_instruction.txt");

/// Version tag of [`DEFAULT_TEMPLATE`].  Bump whenever the asset changes.
pub const DEFAULT_TEMPLATE_VERSION: &str = "2.0";

/// Point-in-time view of the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSnapshot {
    pub text: Arc<str>,
    /// 0 for the initial value, incremented on every accepted write
    /// (including resets).
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct SystemInstructionTemplate {
    cell: Arc<watch::Sender<TemplateSnapshot>>,
}

impl SystemInstructionTemplate {
    /// A handle initialised to [`DEFAULT_TEMPLATE`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TemplateSnapshot {
            text: Arc::from(DEFAULT_TEMPLATE),
            revision: 0,
        });
        Self { cell: Arc::new(tx) }
    }

    /// A handle initialised to `text`, or an error if `text` is blank.
    pub fn with_text(text: impl Into<String>) -> Result<Self, PromptError> {
        let template = Self::new();
        let text = text.into();
        if text.trim().is_empty() {
            return Err(PromptError::BlankTemplate);
        }
        template.cell.send_modify(|snap| snap.text = Arc::from(text));
        Ok(template)
    }

    /// The current template text.  Never blank.
    pub fn get(&self) -> Arc<str> {
        self.cell.borrow().text.clone()
    }

    pub fn snapshot(&self) -> TemplateSnapshot {
        self.cell.borrow().clone()
    }

    pub fn revision(&self) -> u64 {
        self.cell.borrow().revision
    }

    pub fn is_default(&self) -> bool {
        &*self.cell.borrow().text == DEFAULT_TEMPLATE
    }

    /// Replace the template.  Returns the new revision.
    ///
    /// Blank input is rejected and the previous value stays active.
    pub fn set(&self, text: impl Into<String>) -> Result<u64, PromptError> {
        let text = text.into();
        if text.trim().is_empty() {
            warn!("Rejected blank system instruction template");
            return Err(PromptError::BlankTemplate);
        }

        let len = text.len();
        let mut revision = 0;
        self.cell.send_modify(|snap| {
            snap.text = Arc::from(text);
            snap.revision += 1;
            revision = snap.revision;
        });

        info!(revision, len, "System instruction template replaced");
        Ok(revision)
    }

    /// Restore [`DEFAULT_TEMPLATE`].  Returns the new revision.
    pub fn reset_to_default(&self) -> u64 {
        let mut revision = 0;
        self.cell.send_modify(|snap| {
            snap.text = Arc::from(DEFAULT_TEMPLATE);
            snap.revision += 1;
            revision = snap.revision;
        });

        info!(revision, "System instruction template reset to default");
        revision
    }

    /// Observe template changes.
    pub fn subscribe(&self) -> watch::Receiver<TemplateSnapshot> {
        self.cell.subscribe()
    }
}

impl Default for SystemInstructionTemplate {
    fn default() -> Self {
        Self::new()
    }
}
