// Cleanup Stack - compensating actions for provisioning mutations
//
// Every successful mutation pushes the action that undoes it. Teardown pops
// them strictly LIFO, so resources are released in the reverse order they
// were created.

use std::cell::RefCell;
use std::fmt;

use tracing::{debug, info, warn};

use crate::domain::NamespaceName;
use crate::error::{NetlabError, Result};

/// Where a compensation runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Host,
    Namespace(NamespaceName),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Host => f.write_str("host"),
            Scope::Namespace(ns) => write!(f, "netns {}", ns),
        }
    }
}

/// What a compensation undoes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LinkDelete,
    LinkMoveBack,
    LinkDown,
    AddrDelete,
    RouteDelete,
    BridgeDetach,
    QdiscDelete,
    IptablesDelete,
    NetnsDelete,
    CGroupClean,
}

impl Operation {
    /// Resources that live in the host's global tables
    ///
    /// Namespaces and cgroups survive the namespace they were created from,
    /// so their compensations are never invalidated with it.
    pub fn is_global(self) -> bool {
        matches!(self, Operation::NetnsDelete | Operation::CGroupClean)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::LinkDelete => "link-delete",
            Operation::LinkMoveBack => "link-move-back",
            Operation::LinkDown => "link-down",
            Operation::AddrDelete => "addr-delete",
            Operation::RouteDelete => "route-delete",
            Operation::BridgeDetach => "bridge-detach",
            Operation::QdiscDelete => "qdisc-delete",
            Operation::IptablesDelete => "iptables-delete",
            Operation::NetnsDelete => "netns-delete",
            Operation::CGroupClean => "cgroup-clean",
        };
        f.write_str(name)
    }
}

/// Zero-argument undo action
pub type UndoAction = Box<dyn FnOnce() -> Result<()>>;

/// One pending compensation
pub struct Compensation {
    pub scope: Scope,
    /// Resource the undo acts on (interface, namespace, cgroup, rule)
    pub target: String,
    pub operation: Operation,
    undo: UndoAction,
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("scope", &self.scope)
            .field("target", &self.target)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// LIFO list of pending compensations
///
/// All methods take `&self`: an undo action may itself inspect the stack
/// while it is being drained. No borrow is held while an action runs.
#[derive(Default)]
pub struct CleanupStack {
    entries: RefCell<Vec<Compensation>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the compensation for a mutation that just succeeded
    pub fn push(
        &self,
        scope: Scope,
        target: impl Into<String>,
        operation: Operation,
        undo: impl FnOnce() -> Result<()> + 'static,
    ) {
        let target = target.into();
        debug!(scope = %scope, target = %target, operation = %operation, "Compensation pushed");
        self.entries.borrow_mut().push(Compensation {
            scope,
            target,
            operation,
            undo: Box::new(undo),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// (scope, target, operation) of every pending entry, oldest first
    pub fn pending(&self) -> Vec<(Scope, String, Operation)> {
        self.entries
            .borrow()
            .iter()
            .map(|c| (c.scope.clone(), c.target.clone(), c.operation))
            .collect()
    }

    /// Drop every compensation scoped to a namespace that no longer exists
    ///
    /// Global operations are kept. Returns the number of entries dropped.
    pub fn invalidate(&self, namespace: &NamespaceName) -> usize {
        let scope = Scope::Namespace(namespace.clone());
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|c| c.scope != scope || c.operation.is_global());
        let dropped = before - entries.len();

        if dropped > 0 {
            info!(namespace = %namespace, dropped = %dropped, "Compensations invalidated");
        }
        dropped
    }

    /// Drop compensations for a resource that was released explicitly
    ///
    /// With `operation` set only entries of that kind are dropped.
    /// Returns the number of entries dropped.
    pub fn remove_target(&self, target: &str, operation: Option<Operation>) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|c| {
            c.target != target || operation.is_some_and(|op| op != c.operation)
        });
        before - entries.len()
    }

    /// Run every pending compensation, newest first
    ///
    /// A failing compensation is logged and draining continues.
    ///
    /// # Errors
    /// - The single failure, or `Aggregate` with every failure in drain order
    pub fn drain(&self) -> Result<()> {
        let mut errors = Vec::new();

        loop {
            // Release the borrow before running the action
            let entry = self.entries.borrow_mut().pop();
            let Some(compensation) = entry else {
                break;
            };

            info!(
                scope = %compensation.scope,
                target = %compensation.target,
                operation = %compensation.operation,
                "Running compensation"
            );

            if let Err(e) = (compensation.undo)() {
                warn!(
                    target = %compensation.target,
                    operation = %compensation.operation,
                    error = %e,
                    "Compensation failed"
                );
                errors.push(e);
            }
        }

        match NetlabError::from_many(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.borrow().iter()).finish()
    }
}
