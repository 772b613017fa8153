//! # charlink-prompt
//!
//! Turns a character persona, recent conversation history and the user's
//! latest message into the single prompt string sent to the generative
//! backend.
//!
//! Everything here is free of I/O.  [`build_prompt`] is a pure function of
//! its input, so prompt-format regressions are caught by plain unit tests.
//! The instruction template that heads every prompt lives in a
//! [`SystemInstructionTemplate`] handle owned by whoever wires the
//! application together and passed to the components that read it.

pub mod assembler;
pub mod template;

mod error;

pub use assembler::{
    build_prompt, build_system_instruction, build_user_prompt, PromptContext, PromptInput,
    PromptParts,
};
pub use error::PromptError;
pub use template::{SystemInstructionTemplate, TemplateSnapshot, DEFAULT_TEMPLATE, DEFAULT_TEMPLATE_VERSION};
