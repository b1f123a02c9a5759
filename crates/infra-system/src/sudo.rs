// Sudo credential provider
// reason: rpassword for the interactive prompt (same as the pattern CLI)
use std::cell::RefCell;
use std::io;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use netlab_core::constants::SUDO_PASSWORD_ENV;
use netlab_core::error::{NetlabError, Result};
use netlab_core::port::CredentialProvider;

type Probe = Box<dyn Fn() -> bool>;
type EnvLookup = Box<dyn Fn(&str) -> Option<String>>;
type Prompt = Box<dyn Fn() -> io::Result<String>>;

/// Resolves the sudo password at most once per process
///
/// Resolution order:
/// 1. `sudo -n true` succeeds: no password needed
/// 2. `NETLAB_SUDO_PASSWORD` is set: use it
/// 3. Prompt on the terminal
pub struct SudoCredentials {
    cached: RefCell<Option<Option<String>>>,
    probe: Probe,
    env: EnvLookup,
    prompt: Prompt,
}

impl SudoCredentials {
    pub fn new() -> Self {
        Self::with_hooks(
            probe_passwordless,
            |key| std::env::var(key).ok(),
            || rpassword::prompt_password("[sudo] password: "),
        )
    }

    /// Provider with replaced probe, environment lookup and prompt
    pub fn with_hooks(
        probe: impl Fn() -> bool + 'static,
        env: impl Fn(&str) -> Option<String> + 'static,
        prompt: impl Fn() -> io::Result<String> + 'static,
    ) -> Self {
        Self {
            cached: RefCell::new(None),
            probe: Box::new(probe),
            env: Box::new(env),
            prompt: Box::new(prompt),
        }
    }

    fn resolve(&self) -> Result<Option<String>> {
        if (self.probe)() {
            info!("Passwordless sudo available");
            return Ok(None);
        }

        if let Some(password) = (self.env)(SUDO_PASSWORD_ENV) {
            debug!(source = %SUDO_PASSWORD_ENV, "Using sudo password from environment");
            return Ok(Some(password));
        }

        (self.prompt)()
            .map(Some)
            .map_err(|e| NetlabError::Elevation(format!("could not read sudo password: {}", e)))
    }
}

impl Default for SudoCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for SudoCredentials {
    fn credential(&self) -> Result<Option<String>> {
        if let Some(cached) = self.cached.borrow().as_ref() {
            return Ok(cached.clone());
        }

        let resolved = self.resolve()?;
        *self.cached.borrow_mut() = Some(resolved.clone());
        Ok(resolved)
    }

    fn reset(&self) {
        self.cached.borrow_mut().take();
    }
}

/// True if sudo works without a password right now
fn probe_passwordless() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counting_prompt(count: &Rc<Cell<usize>>, answer: &'static str) -> impl Fn() -> io::Result<String> {
        let count = Rc::clone(count);
        move || {
            count.set(count.get() + 1);
            Ok(answer.to_string())
        }
    }

    #[test]
    fn test_passwordless_needs_no_credential() {
        let prompts = Rc::new(Cell::new(0));
        let sudo = SudoCredentials::with_hooks(|| true, |_| None, counting_prompt(&prompts, "x"));

        assert_eq!(sudo.credential().unwrap(), None);
        assert_eq!(prompts.get(), 0);
    }

    #[test]
    fn test_environment_override() {
        let prompts = Rc::new(Cell::new(0));
        let sudo = SudoCredentials::with_hooks(
            || false,
            |key| (key == SUDO_PASSWORD_ENV).then(|| "from-env".to_string()),
            counting_prompt(&prompts, "typed"),
        );

        assert_eq!(sudo.credential().unwrap().as_deref(), Some("from-env"));
        assert_eq!(prompts.get(), 0);
    }

    #[test]
    fn test_prompt_is_memoized_until_reset() {
        let prompts = Rc::new(Cell::new(0));
        let sudo = SudoCredentials::with_hooks(|| false, |_| None, counting_prompt(&prompts, "typed"));

        assert_eq!(sudo.credential().unwrap().as_deref(), Some("typed"));
        assert_eq!(sudo.credential().unwrap().as_deref(), Some("typed"));
        assert_eq!(prompts.get(), 1);

        sudo.reset();
        sudo.credential().unwrap();
        assert_eq!(prompts.get(), 2);
    }

    #[test]
    fn test_prompt_failure_is_elevation_error() {
        let sudo = SudoCredentials::with_hooks(
            || false,
            |_| None,
            || Err(io::Error::new(io::ErrorKind::NotFound, "no tty")),
        );

        let err = sudo.credential().unwrap_err();
        assert!(matches!(err, NetlabError::Elevation(ref m) if m.contains("no tty")));
    }
}
