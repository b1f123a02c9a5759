// Subcommand implementations

mod demo;
mod exec;
mod run;
mod sweep;

pub use demo::demo;
pub use exec::{exec, ExecRequest};
pub use run::run;
pub use sweep::sweep;
