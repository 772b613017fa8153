use thiserror::Error;

/// Errors produced while assembling a prompt or replacing the template.
///
/// Each of these is a caller bug rather than a runtime condition: nothing
/// here is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("System instruction cannot be empty")]
    BlankSystemInstruction,

    #[error("Current message cannot be empty")]
    BlankUtterance,

    /// A replacement template was blank; the previous template stays active.
    #[error("System instruction template cannot be empty")]
    BlankTemplate,
}
