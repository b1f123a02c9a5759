// Namespace Shell - runs every command inside one network namespace

use std::rc::Rc;

use crate::domain::{NamespaceName, RunHandle, RunRecord};
use crate::error::Result;
use crate::port::{AsyncOptions, RunOptions, Shell};

/// Shell adapter prefixing `ip netns exec <ns>` to every command
///
/// Elevation, monitoring and error classification are left to the wrapped
/// shell.
pub struct NamespaceShell {
    namespace: NamespaceName,
    inner: Rc<dyn Shell>,
}

impl NamespaceShell {
    pub fn new(namespace: NamespaceName, inner: Rc<dyn Shell>) -> Self {
        Self { namespace, inner }
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    fn wrap(&self, cmd: &str) -> String {
        format!("ip netns exec {} {}", self.namespace, cmd)
    }
}

impl Shell for NamespaceShell {
    fn run(&self, cmd: &str, options: RunOptions) -> Result<RunRecord> {
        self.inner.run(&self.wrap(cmd), options)
    }

    fn run_async(&self, cmd: &str, options: AsyncOptions) -> Result<RunHandle> {
        self.inner.run_async(&self.wrap(cmd), options)
    }
}
