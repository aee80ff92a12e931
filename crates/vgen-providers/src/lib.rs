//! Generation providers.
//!
//! A provider turns one task request (scene, stage, upstream artifacts) into
//! bytes, or fails with a classified error. The scheduler's retry decision
//! depends entirely on that classification.

pub mod error;
pub mod http;
pub mod provider;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use http::{HttpProvider, HttpProviderConfig};
pub use provider::{GenerationProvider, ProviderSet};
pub use types::{GeneratedArtifact, GenerationRequest};
