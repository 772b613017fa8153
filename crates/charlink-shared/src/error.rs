use thiserror::Error;

/// A caller-correctable problem detected before any I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field was empty or whitespace only.
    #[error("{0} cannot be empty")]
    Blank(&'static str),

    /// A character record is missing one of `id`, `owner_id` or `name`.
    #[error("Invalid character: {0} is required")]
    InvalidCharacter(&'static str),

    /// Character creation was attempted without an avatar image.
    #[error("Please select an image")]
    MissingAvatar,

    /// The payload exceeds a configured size bound.
    #[error("{what} too large: {size} bytes (max {max})")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },
}

/// Reject blank input for the named field.
pub fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank(field));
    }
    Ok(())
}
