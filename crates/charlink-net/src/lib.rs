//! # charlink-net
//!
//! Outbound HTTP integrations: the generative text backend that produces
//! character replies and the image host that stores character avatars.
//!
//! Each integration is a trait ([`GenerativeBackend`], [`ImageHost`]) with
//! one reqwest-based implementation.  Callers hold the trait object so tests
//! can substitute doubles.

pub mod gemini;
pub mod generative;
pub mod imgbb;

mod error;

pub use error::{BackendError, ImageHostError};
pub use gemini::{GeminiClient, GeminiConfig};
pub use generative::{CompletionStream, GenerativeBackend};
pub use imgbb::{ImageHost, ImgBbUploader};
