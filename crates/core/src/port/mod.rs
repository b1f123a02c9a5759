// Port Layer - Interfaces for external dependencies

pub mod credentials;
pub mod event_source;
pub mod shell;

// Re-exports
pub use credentials::CredentialProvider;
pub use event_source::{EventSource, Readiness, Token};
pub use shell::{AsyncOptions, OutputCallback, RunOptions, Shell};
