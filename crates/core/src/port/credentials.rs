// Credential Provider Port
// Supplies the secret piped into elevated children, resolved at most once.

use crate::error::Result;

/// Source of the privilege-elevation credential
///
/// Implementations memoize internally: the first call may probe or prompt,
/// later calls return the cached value until [`reset`](Self::reset).
pub trait CredentialProvider {
    /// The credential to pipe into elevated children
    ///
    /// `None` means elevation works without one (passwordless sudo, or
    /// already root).
    ///
    /// # Errors
    /// - `Elevation` if a credential is required but cannot be obtained
    fn credential(&self) -> Result<Option<String>>;

    /// Forget the cached credential; the next call resolves it again
    fn reset(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::cell::Cell;

    /// Provider returning a fixed credential and counting resolutions
    pub struct StaticCredentials {
        credential: Option<String>,
        calls: Cell<usize>,
    }

    impl StaticCredentials {
        pub fn new(credential: Option<&str>) -> Self {
            Self {
                credential: credential.map(str::to_string),
                calls: Cell::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.get()
        }
    }

    impl CredentialProvider for StaticCredentials {
        fn credential(&self) -> Result<Option<String>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.credential.clone())
        }

        fn reset(&self) {}
    }
}
