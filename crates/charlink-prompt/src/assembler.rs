//! Prompt rendering.
//!
//! The rendered prompt is a fixed sequence of sections:
//!
//! 1. the system instruction (always);
//! 2. the character persona (only when non-blank);
//! 3. memories, one bullet per item (only when non-empty);
//! 4. conversation history, one line per item in the given order (only when
//!    non-empty);
//! 5. the current message (always, always last).
//!
//! The section labels below are part of what the instruction template
//! refers to by name ("CONVERSATION HISTORY", "CURRENT MESSAGE", ...).  They
//! may change, but only together with the template text.

use std::fmt::Write as _;

use crate::error::PromptError;

pub const PERSONA_LABEL: &str = "══════════ CHARACTER PERSONA ══════════";
pub const MEMORIES_LABEL: &str = "══════════ MEMORIES ══════════";
pub const HISTORY_LABEL: &str = "══════════ CONVERSATION HISTORY ══════════";
pub const CURRENT_MESSAGE_LABEL: &str = "══════════ CURRENT MESSAGE ══════════";

const MEMORIES_PREAMBLE: &str = "Things you remember about the user:";

/// Borrowed inputs for one prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInput<'a> {
    pub system_instruction: &'a str,
    pub current_utterance: &'a str,
    pub persona: Option<&'a str>,
    pub memories: &'a [String],
    pub history: &'a [String],
}

impl PromptInput<'_> {
    fn validate(&self) -> Result<(), PromptError> {
        if self.system_instruction.trim().is_empty() {
            return Err(PromptError::BlankSystemInstruction);
        }
        if self.current_utterance.trim().is_empty() {
            return Err(PromptError::BlankUtterance);
        }
        Ok(())
    }

    fn persona(&self) -> Option<&str> {
        self.persona.filter(|p| !p.trim().is_empty())
    }
}

/// Render the full prompt.
///
/// Fails without producing anything when the system instruction or the
/// current utterance is blank.
pub fn build_prompt(input: &PromptInput<'_>) -> Result<String, PromptError> {
    input.validate()?;

    let mut out = String::with_capacity(
        input.system_instruction.len() + input.current_utterance.len() + 256,
    );

    out.push_str(input.system_instruction);
    out.push_str("\n\n");

    if let Some(persona) = input.persona() {
        let _ = write!(out, "{PERSONA_LABEL}\n{persona}\n\n");
    }

    if !input.memories.is_empty() {
        let _ = writeln!(out, "{MEMORIES_LABEL}\n{MEMORIES_PREAMBLE}");
        for memory in input.memories {
            let _ = writeln!(out, "• {memory}");
        }
        out.push('\n');
    }

    if !input.history.is_empty() {
        let _ = writeln!(out, "{HISTORY_LABEL}");
        for line in input.history {
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');
    }

    let _ = write!(out, "{CURRENT_MESSAGE_LABEL}\n{}", input.current_utterance);
    Ok(out)
}

/// Render the prompt without the system instruction, for backends that take
/// the instruction as a separate parameter.
pub fn build_user_prompt(input: &PromptInput<'_>) -> Result<String, PromptError> {
    input.validate()?;

    let mut out = String::new();

    if let Some(persona) = input.persona() {
        let _ = write!(out, "Character Context:\n{persona}\n\n");
    }

    if !input.memories.is_empty() {
        out.push_str("Remembered:\n");
        for memory in input.memories {
            let _ = writeln!(out, "• {memory}");
        }
        out.push('\n');
    }

    if !input.history.is_empty() {
        out.push_str("Recent Conversation:\n");
        for line in input.history {
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');
    }

    out.push_str(input.current_utterance);
    Ok(out)
}

/// The template followed by the persona section.
pub fn build_system_instruction(template: &str, persona: &str) -> String {
    if persona.trim().is_empty() {
        return template.to_string();
    }
    format!("{template}\n\n{PERSONA_LABEL}\n{persona}")
}

// ---------------------------------------------------------------------------
// Owned context
// ---------------------------------------------------------------------------

/// Named parameters for [`PromptContext::new`].
#[derive(Debug, Clone, Default)]
pub struct PromptParts {
    pub system_instruction: String,
    pub current_utterance: String,
    pub persona: Option<String>,
    pub memories: Vec<String>,
    pub history: Vec<String>,
}

/// Everything that goes into one backend call.  Built per call, then
/// dropped.
#[derive(Debug, Clone)]
pub struct PromptContext {
    parts: PromptParts,
}

impl PromptContext {
    pub fn new(parts: PromptParts) -> Result<Self, PromptError> {
        let context = Self { parts };
        context.input().validate()?;
        Ok(context)
    }

    pub fn input(&self) -> PromptInput<'_> {
        PromptInput {
            system_instruction: &self.parts.system_instruction,
            current_utterance: &self.parts.current_utterance,
            persona: self.parts.persona.as_deref(),
            memories: &self.parts.memories,
            history: &self.parts.history,
        }
    }

    pub fn render(&self) -> String {
        // Validated on construction.
        build_prompt(&self.input()).unwrap_or_default()
    }

    pub fn render_user_prompt(&self) -> String {
        build_user_prompt(&self.input()).unwrap_or_default()
    }

    /// Template plus persona section.
    pub fn system_instruction(&self) -> String {
        build_system_instruction(
            &self.parts.system_instruction,
            self.parts.persona.as_deref().unwrap_or_default(),
        )
    }

    pub fn history(&self) -> &[String] {
        &self.parts.history
    }

    pub fn current_utterance(&self) -> &str {
        &self.parts.current_utterance
    }
}
