// netlab Core - Domain Logic & Ports
// NO OS process handling here; adapters live in netlab-infra-system

pub mod application;
pub mod constants;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{NetlabError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
