// Network - provisioning commands with compensating cleanup
//
// A root Network owns one Context: the host shell, the cleanup stack and the
// live namespace and cgroup sets. Networks returned by `netns_add` share that
// context but run their commands through a namespace-prefixed shell.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::application::cgroup::{CGroup, CGroupLimits};
use crate::application::cleanup::{CleanupStack, Operation, Scope};
use crate::application::namespace_shell::NamespaceShell;
use crate::constants::{DEFAULT_CGROUP_ROOT, HOST_NETNS};
use crate::domain::scoped::default_uid;
use crate::domain::{CGroupName, InterfaceName, NamespaceName, RunHandle, RunRecord};
use crate::error::{NetlabError, Result};
use crate::port::{AsyncOptions, RunOptions, Shell};

/// Settings shared by a root network and every namespace below it
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Uid used to scope names created through this network
    pub uid: u32,
    pub cgroup_root: PathBuf,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

/// netem parameters for [`Network::tc`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Netem {
    pub delay_ms: Option<u32>,
    pub loss_percent: Option<f64>,
    pub rate_mbit: Option<u32>,
    pub limit: Option<u32>,
}

impl Netem {
    fn args(&self) -> String {
        let mut args = String::new();
        if let Some(delay) = self.delay_ms {
            args.push_str(&format!(" delay {}ms", delay));
        }
        if let Some(loss) = self.loss_percent {
            args.push_str(&format!(" loss {}%", loss));
        }
        if let Some(rate) = self.rate_mbit {
            args.push_str(&format!(" rate {}Mbit", rate));
        }
        if let Some(limit) = self.limit {
            args.push_str(&format!(" limit {}", limit));
        }
        args
    }
}

struct Context {
    host: Rc<dyn Shell>,
    stack: CleanupStack,
    namespaces: RefCell<BTreeSet<NamespaceName>>,
    cgroups: RefCell<BTreeMap<CGroupName, CGroup>>,
    options: NetworkOptions,
}

impl Context {
    /// Kill every process inside a namespace
    ///
    /// Each kill is attempted even when an earlier one failed; a pid may exit
    /// between listing and killing.
    fn kill_all(&self, namespace: &NamespaceName) -> Result<()> {
        let mut errors = Vec::new();
        for pid in process_list(self.host.as_ref(), namespace)? {
            if let Err(e) = kill_process(self.host.as_ref(), namespace, pid) {
                warn!(namespace = %namespace, pid = %pid, error = %e, "Kill failed");
                errors.push(e);
            }
        }
        NetlabError::from_many(errors).map_or(Ok(()), Err)
    }

    /// Kill everything inside a namespace and delete it
    ///
    /// The delete is always attempted. The namespace leaves the live set only
    /// once the delete succeeded.
    fn delete_namespace(&self, namespace: &NamespaceName) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.kill_all(namespace) {
            errors.push(e);
        }

        match self
            .host
            .run(&format!("ip netns delete {}", namespace), RunOptions::new())
        {
            Ok(_) => {
                self.namespaces.borrow_mut().remove(namespace);
                info!(namespace = %namespace, "Namespace deleted");
            }
            Err(e) => errors.push(e),
        }

        NetlabError::from_many(errors).map_or(Ok(()), Err)
    }

    /// Release a cgroup; it stays tracked if the release fails
    fn clean_cgroup(&self, name: &CGroupName) -> Result<()> {
        let mut cgroups = self.cgroups.borrow_mut();
        let Some(group) = cgroups.get_mut(name) else {
            return Ok(());
        };
        group.hard_clean()?;
        cgroups.remove(name);
        Ok(())
    }
}

/// Provisioning front-end bound to the host or to one namespace
///
/// Every successful mutation pushes its compensation onto the shared cleanup
/// stack; [`cleanup`](Self::cleanup) undoes all of them in reverse order.
///
/// # Example
/// ```text
/// let net = Network::new(host_shell);
/// let ns0 = net.netns_add(&net.namespace("ns0")?)?;
/// net.link_veth_add(&p0, &p1)?;
/// net.link_set(&ns0_name, &p0)?;
/// ns0.addr_add("10.0.0.1/24", &p0)?;
/// ns0.up(&p0)?;
/// net.cleanup()?;
/// ```
pub struct Network {
    shell: Rc<dyn Shell>,
    scope: Scope,
    context: Rc<Context>,
}

impl Network {
    pub fn new(host: Rc<dyn Shell>) -> Self {
        Self::with_options(host, NetworkOptions::default())
    }

    pub fn with_options(host: Rc<dyn Shell>, options: NetworkOptions) -> Self {
        let context = Rc::new(Context {
            host: Rc::clone(&host),
            stack: CleanupStack::new(),
            namespaces: RefCell::new(BTreeSet::new()),
            cgroups: RefCell::new(BTreeMap::new()),
            options,
        });
        Self {
            shell: host,
            scope: Scope::Host,
            context,
        }
    }

    /// The shell this network runs its commands through
    pub fn shell(&self) -> Rc<dyn Shell> {
        Rc::clone(&self.shell)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn uid(&self) -> u32 {
        self.context.options.uid
    }

    /// Scope an interface name with this network's uid
    pub fn interface(&self, name: &str) -> Result<InterfaceName> {
        InterfaceName::new(name, self.uid())
    }

    /// Scope a namespace name with this network's uid
    pub fn namespace(&self, name: &str) -> Result<NamespaceName> {
        NamespaceName::new(name, self.uid())
    }

    /// Scope a cgroup name with this network's uid
    pub fn cgroup(&self, name: &str) -> Result<CGroupName> {
        CGroupName::new(name, self.uid())
    }

    /// Namespaces created and not yet deleted
    pub fn live_namespaces(&self) -> Vec<NamespaceName> {
        self.context.namespaces.borrow().iter().cloned().collect()
    }

    /// Cgroups created and not yet deleted
    pub fn live_cgroups(&self) -> Vec<CGroupName> {
        self.context.cgroups.borrow().keys().cloned().collect()
    }

    /// Number of compensations waiting for cleanup
    pub fn pending_cleanups(&self) -> usize {
        self.context.stack.len()
    }

    fn exec(&self, cmd: &str) -> Result<RunRecord> {
        self.shell.run(cmd, RunOptions::new())
    }

    /// Push a compensation that runs `undo_cmd` through this network's shell
    fn push_undo(&self, target: impl Into<String>, operation: Operation, undo_cmd: String) {
        let shell = Rc::clone(&self.shell);
        self.context
            .stack
            .push(self.scope.clone(), target, operation, move || {
                shell.run(&undo_cmd, RunOptions::new()).map(|_| ())
            });
    }

    /// Create a veth pair; deleting `p1` later removes both ends
    pub fn link_veth_add(&self, p1: &InterfaceName, p2: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link add {} type veth peer name {}", p1, p2))?;
        self.push_undo(
            p1.scoped(),
            Operation::LinkDelete,
            format!("ip link delete {}", p1),
        );
        Ok(())
    }

    /// Move an interface into a namespace
    ///
    /// The compensation moves it back from inside the target namespace.
    pub fn link_set(&self, namespace: &NamespaceName, interface: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link set {} netns {}", interface, namespace))?;

        let origin = match &self.scope {
            Scope::Host => HOST_NETNS.to_string(),
            Scope::Namespace(ns) => ns.scoped(),
        };
        let target_shell: Rc<dyn Shell> = Rc::new(NamespaceShell::new(
            namespace.clone(),
            Rc::clone(&self.context.host),
        ));
        let undo_cmd = format!("ip link set {} netns {}", interface, origin);
        self.context.stack.push(
            Scope::Namespace(namespace.clone()),
            interface.scoped(),
            Operation::LinkMoveBack,
            move || target_shell.run(&undo_cmd, RunOptions::new()).map(|_| ()),
        );
        Ok(())
    }

    /// Interface names from `ip link list`, sorted
    ///
    /// # Arguments
    /// * `link_type` - Restrict to one link type (`veth`, `bridge`, ..)
    pub fn link_list(&self, link_type: Option<&str>) -> Result<Vec<String>> {
        let mut cmd = "ip link list".to_string();
        if let Some(link_type) = link_type {
            cmd.push_str(&format!(" type {}", link_type));
        }

        let record = self.exec(&cmd)?;
        let mut names = parse_link_names(&record.stdout);
        names.sort();
        Ok(names)
    }

    /// Delete an interface and forget every compensation aimed at it
    pub fn link_delete(&self, interface: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link delete {}", interface))?;
        self.context.stack.remove_target(&interface.scoped(), None);
        Ok(())
    }

    pub fn addr_add(&self, ip: &str, interface: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip addr add {} dev {}", ip, interface))?;
        self.push_undo(
            interface.scoped(),
            Operation::AddrDelete,
            format!("ip addr del {} dev {}", ip, interface),
        );
        Ok(())
    }

    pub fn up(&self, interface: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link set dev {} up", interface))?;
        self.push_undo(
            interface.scoped(),
            Operation::LinkDown,
            format!("ip link set dev {} down", interface),
        );
        Ok(())
    }

    /// Add a default route via `ip`
    pub fn route(&self, ip: &str) -> Result<()> {
        self.exec(&format!("ip route add default via {}", ip))?;
        self.push_undo(
            ip,
            Operation::RouteDelete,
            format!("ip route del default via {}", ip),
        );
        Ok(())
    }

    pub fn bridge_add(&self, name: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link add name {} type bridge", name))?;
        self.push_undo(
            name.scoped(),
            Operation::LinkDelete,
            format!("ip link delete {}", name),
        );
        Ok(())
    }

    pub fn bridge_up(&self, name: &InterfaceName) -> Result<()> {
        self.up(name)
    }

    /// Attach an interface to a bridge
    pub fn bridge_set(&self, name: &InterfaceName, interface: &InterfaceName) -> Result<()> {
        self.exec(&format!("ip link set {} master {}", interface, name))?;
        self.push_undo(
            interface.scoped(),
            Operation::BridgeDetach,
            format!("ip link set {} nomaster", interface),
        );
        Ok(())
    }

    pub fn bridge_list(&self) -> Result<Vec<String>> {
        self.link_list(Some("bridge"))
    }

    /// Current queueing disciplines on an interface
    pub fn tc_show(&self, interface: &InterfaceName) -> Result<RunRecord> {
        run_sbin_fallback(
            self.shell.as_ref(),
            "tc",
            &format!("tc qdisc show dev {}", interface),
        )
    }

    /// Add or change the root netem qdisc of an interface
    ///
    /// Only a freshly added qdisc gets a compensation; changing an existing
    /// one leaves its original owner responsible for removing it.
    pub fn tc(&self, interface: &InterfaceName, netem: Netem) -> Result<()> {
        let current = self.tc_show(interface)?;
        let action = if current.stdout.contains("netem") {
            "change"
        } else {
            "add"
        };

        let cmd = format!(
            "tc qdisc {} dev {} root netem{}",
            action,
            interface,
            netem.args()
        );
        run_sbin_fallback(self.shell.as_ref(), "tc", &cmd)?;

        if action == "add" {
            self.push_undo(
                interface.scoped(),
                Operation::QdiscDelete,
                format!("tc qdisc del dev {} root", interface),
            );
        }
        Ok(())
    }

    /// Accept forwarded traffic from `to_interface` out of `from_interface`
    pub fn forward(&self, from_interface: &InterfaceName, to_interface: &InterfaceName) -> Result<()> {
        let rule = format!(
            "FORWARD -o {} -i {} -j ACCEPT",
            from_interface, to_interface
        );
        self.iptables("", &rule)
    }

    /// Masquerade traffic from `ip` leaving through `interface`
    pub fn nat(&self, ip: &str, interface: &InterfaceName) -> Result<()> {
        let rule = format!("POSTROUTING -s {} -o {} -j MASQUERADE", ip, interface);
        self.iptables("-t nat ", &rule)
    }

    fn iptables(&self, table: &str, rule: &str) -> Result<()> {
        run_sbin_fallback(
            self.shell.as_ref(),
            "iptables",
            &format!("iptables {}-A {}", table, rule),
        )?;

        let shell = Rc::clone(&self.shell);
        let undo_cmd = format!("iptables {}-D {}", table, rule);
        self.context.stack.push(
            self.scope.clone(),
            rule,
            Operation::IptablesDelete,
            move || run_sbin_fallback(shell.as_ref(), "iptables", &undo_cmd).map(|_| ()),
        );
        Ok(())
    }

    /// Names of every network namespace on the host
    pub fn netns_list(&self) -> Result<Vec<String>> {
        let record = self
            .context
            .host
            .run("ip netns list", RunOptions::new())?;
        Ok(record
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    /// Pids of the processes running inside a namespace
    pub fn netns_process_list(&self, namespace: &NamespaceName) -> Result<Vec<u32>> {
        process_list(self.context.host.as_ref(), namespace)
    }

    pub fn netns_kill_process(&self, namespace: &NamespaceName, pid: u32) -> Result<()> {
        kill_process(self.context.host.as_ref(), namespace, pid)
    }

    pub fn netns_kill_all(&self, namespace: &NamespaceName) -> Result<()> {
        self.context.kill_all(namespace)
    }

    /// Create a namespace and return a network bound to it
    ///
    /// The returned network shares this network's cleanup stack. The
    /// compensation kills every process inside and deletes the namespace.
    pub fn netns_add(&self, namespace: &NamespaceName) -> Result<Network> {
        self.context
            .host
            .run(&format!("ip netns add {}", namespace), RunOptions::new())?;
        self.context.namespaces.borrow_mut().insert(namespace.clone());
        info!(namespace = %namespace, "Namespace added");

        let context: Weak<Context> = Rc::downgrade(&self.context);
        let name = namespace.clone();
        self.context.stack.push(
            self.scope.clone(),
            namespace.scoped(),
            Operation::NetnsDelete,
            move || match context.upgrade() {
                Some(context) => context.delete_namespace(&name),
                None => Ok(()),
            },
        );

        Ok(Network {
            shell: Rc::new(NamespaceShell::new(
                namespace.clone(),
                Rc::clone(&self.context.host),
            )),
            scope: Scope::Namespace(namespace.clone()),
            context: Rc::clone(&self.context),
        })
    }

    /// Delete a namespace now
    ///
    /// Compensations scoped to the namespace are dropped with it, as is the
    /// pending deletion pushed by `netns_add`.
    pub fn netns_delete(&self, namespace: &NamespaceName) -> Result<()> {
        self.context
            .host
            .run(&format!("ip netns delete {}", namespace), RunOptions::new())?;
        self.context.namespaces.borrow_mut().remove(namespace);
        self.context.stack.invalidate(namespace);
        self.context
            .stack
            .remove_target(&namespace.scoped(), Some(Operation::NetnsDelete));
        info!(namespace = %namespace, "Namespace deleted");
        Ok(())
    }

    /// Run a command to completion in this network's scope
    pub fn run(&self, cmd: &str, options: RunOptions) -> Result<RunRecord> {
        self.shell.run(cmd, options)
    }

    /// Start a monitored command in this network's scope
    pub fn run_async(&self, cmd: &str, options: AsyncOptions) -> Result<RunHandle> {
        self.shell.run_async(cmd, options)
    }

    /// Create a cgroup with limits and move `pids` into it
    ///
    /// A cgroup of the same name left behind by an earlier run is replaced.
    pub fn cgroup_add(&self, name: &CGroupName, limits: CGroupLimits, pids: &[u32]) -> Result<()> {
        let mut group = CGroup::new(
            name.clone(),
            Rc::clone(&self.context.host),
            self.context.options.cgroup_root.clone(),
            limits,
        )?;
        group.build(true)?;
        for pid in pids {
            group.add_pid(*pid)?;
        }
        self.context.cgroups.borrow_mut().insert(name.clone(), group);

        let context: Weak<Context> = Rc::downgrade(&self.context);
        let target = name.clone();
        self.context.stack.push(
            self.scope.clone(),
            name.scoped(),
            Operation::CGroupClean,
            move || match context.upgrade() {
                Some(context) => context.clean_cgroup(&target),
                None => Ok(()),
            },
        );
        Ok(())
    }

    /// Move another process into a cgroup created by `cgroup_add`
    pub fn cgroup_add_pid(&self, name: &CGroupName, pid: u32) -> Result<()> {
        let mut cgroups = self.context.cgroups.borrow_mut();
        let group = cgroups
            .get_mut(name)
            .ok_or_else(|| NetlabError::InvalidInput(format!("unknown cgroup {}", name)))?;
        group.add_pid(pid)
    }

    /// Release a cgroup now
    pub fn cgroup_delete(&self, name: &CGroupName) -> Result<()> {
        self.context.clean_cgroup(name)?;
        self.context
            .stack
            .remove_target(&name.scoped(), Some(Operation::CGroupClean));
        Ok(())
    }

    /// Undo every provisioning mutation in reverse order
    ///
    /// Failing compensations do not stop the drain; their errors are
    /// returned together.
    ///
    /// # Panics
    /// If a namespace or cgroup is still live after the drain. That means a
    /// mutation escaped the cleanup stack.
    pub fn cleanup(&self) -> Result<()> {
        info!(pending = %self.context.stack.len(), "Cleaning up network");
        let result = self.context.stack.drain();

        assert!(
            self.context.stack.is_empty(),
            "cleanup stack not empty after drain"
        );
        assert!(
            self.context.namespaces.borrow().is_empty(),
            "namespaces still live after cleanup: {:?}",
            self.context.namespaces.borrow()
        );
        assert!(
            self.context.cgroups.borrow().is_empty(),
            "cgroups still live after cleanup: {:?}",
            self.context.cgroups.borrow().keys().collect::<Vec<_>>()
        );

        if let Err(e) = &result {
            warn!(error = %e, "Cleanup finished with errors");
        }
        result
    }
}

fn process_list(host: &dyn Shell, namespace: &NamespaceName) -> Result<Vec<u32>> {
    let record = host.run(&format!("ip netns pids {}", namespace), RunOptions::new())?;
    Ok(record
        .stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

fn kill_process(host: &dyn Shell, namespace: &NamespaceName, pid: u32) -> Result<()> {
    debug!(namespace = %namespace, pid = %pid, "Killing namespace process");
    host.run(
        &format!("ip netns exec {} kill -9 {}", namespace, pid),
        RunOptions::new(),
    )
    .map(|_| ())
}

/// Run a command, retrying from /usr/sbin when the tool is not on PATH
///
/// `ip netns exec` resets PATH on some distributions, which hides `tc` and
/// `iptables`.
fn run_sbin_fallback(shell: &dyn Shell, tool: &str, cmd: &str) -> Result<RunRecord> {
    match shell.run(cmd, RunOptions::new()) {
        Err(NetlabError::Command(record))
            if record
                .stderr
                .contains(&format!("exec of \"{}\" failed", tool)) =>
        {
            debug!(tool = %tool, "Retrying from /usr/sbin");
            shell.run(&format!("/usr/sbin/{}", cmd), RunOptions::new())
        }
        other => other,
    }
}

/// Interface names from `ip link list` output
///
/// Matches lines like `3: veth0@veth1: <BROADCAST,...>`.
fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.split_once(": ")?;
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let end = rest.find([':', '@'])?;
            let name = &rest[..end];
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::shell::mocks::RecordingShell;

    fn network() -> (Rc<RecordingShell>, Network) {
        let shell = Rc::new(RecordingShell::new());
        let options = NetworkOptions {
            uid: 1,
            cgroup_root: PathBuf::from("/nonexistent/cgroup"),
        };
        let net = Network::with_options(shell.clone(), options);
        (shell, net)
    }

    #[test]
    fn test_cleanup_reverses_mutations() {
        let (shell, net) = network();
        let p0 = net.interface("p0").unwrap();
        let p1 = net.interface("p1").unwrap();
        let br = net.interface("br0").unwrap();

        net.link_veth_add(&p0, &p1).unwrap();
        net.addr_add("10.0.0.1/24", &p0).unwrap();
        net.up(&p0).unwrap();
        net.bridge_add(&br).unwrap();
        net.bridge_set(&br, &p1).unwrap();
        net.route("10.0.0.254").unwrap();
        assert_eq!(net.pending_cleanups(), 6);

        let before = shell.calls().len();
        net.cleanup().unwrap();
        let undo: Vec<String> = shell.calls()[before..].to_vec();

        assert_eq!(
            undo,
            vec![
                "ip route del default via 10.0.0.254",
                "ip link set n-2-p1 nomaster",
                "ip link delete n-2-br0",
                "ip link set dev n-2-p0 down",
                "ip addr del 10.0.0.1/24 dev n-2-p0",
                "ip link delete n-2-p0",
            ]
        );
        assert_eq!(net.pending_cleanups(), 0);
    }

    #[test]
    fn test_failed_mutation_pushes_nothing() {
        let (shell, net) = network();
        shell.fail_on("ip addr add");
        let p0 = net.interface("p0").unwrap();

        assert!(net.addr_add("10.0.0.1/24", &p0).is_err());
        assert_eq!(net.pending_cleanups(), 0);
    }

    #[test]
    fn test_cleanup_collects_every_failure() {
        let (shell, net) = network();
        for name in ["a", "b", "c"] {
            net.up(&net.interface(name).unwrap()).unwrap();
        }
        shell.fail_on("n-2-a down");
        shell.fail_on("n-2-c down");

        let err = net.cleanup().unwrap_err();

        assert_eq!(err.constituents().len(), 2);
        assert_eq!(shell.calls_matching("down").len(), 3);
        assert_eq!(net.pending_cleanups(), 0);
    }

    #[test]
    fn test_namespace_network_prefixes_commands() {
        let (shell, net) = network();
        let ns = net.namespace("ns0").unwrap();
        let p0 = net.interface("p0").unwrap();

        let inner = net.netns_add(&ns).unwrap();
        assert_eq!(inner.scope(), &Scope::Namespace(ns.clone()));
        inner.addr_add("10.0.0.1/24", &p0).unwrap();

        let calls = shell.calls();
        assert_eq!(calls[0], "ip netns add n-2-ns0");
        assert_eq!(calls[1], "ip netns exec n-2-ns0 ip addr add 10.0.0.1/24 dev n-2-p0");
        assert_eq!(net.live_namespaces(), vec![ns]);
    }

    #[test]
    fn test_namespace_cleanup_kills_processes() {
        let (shell, net) = network();
        shell.respond("ip netns pids", "101\n202\n");
        let ns = net.namespace("ns0").unwrap();
        let inner = net.netns_add(&ns).unwrap();
        inner.up(&net.interface("lo").unwrap()).unwrap();

        net.cleanup().unwrap();

        let calls = shell.calls();
        let tail: Vec<&str> = calls[2..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "ip netns exec n-2-ns0 ip link set dev lo down",
                "ip netns pids n-2-ns0",
                "ip netns exec n-2-ns0 kill -9 101",
                "ip netns exec n-2-ns0 kill -9 202",
                "ip netns delete n-2-ns0",
            ]
        );
        assert!(net.live_namespaces().is_empty());
    }

    #[test]
    fn test_failed_kill_still_deletes_namespace() {
        let (shell, net) = network();
        shell.respond("ip netns pids", "101\n202\n");
        shell.fail_on("kill -9 101");
        let ns = net.namespace("ns0").unwrap();
        net.netns_add(&ns).unwrap();

        let err = net.cleanup().unwrap_err();

        assert!(matches!(&err, NetlabError::Command(r) if r.cmd.contains("kill -9 101")));
        assert_eq!(shell.calls_matching("kill -9 202").len(), 1);
        assert_eq!(
            shell.calls_matching("ip netns delete"),
            vec!["ip netns delete n-2-ns0"]
        );
        assert!(net.live_namespaces().is_empty());
    }

    #[test]
    #[should_panic(expected = "namespaces still live after cleanup")]
    fn test_failed_namespace_delete_stays_live() {
        let (shell, net) = network();
        shell.fail_on("ip netns delete");
        let ns = net.namespace("ns0").unwrap();
        net.netns_add(&ns).unwrap();

        let _ = net.cleanup();
    }

    #[test]
    fn test_failed_cgroup_release_stays_tracked() {
        let root = tempfile::tempdir().unwrap();
        let shell = Rc::new(RecordingShell::new());
        let options = NetworkOptions {
            uid: 1,
            cgroup_root: root.path().to_path_buf(),
        };
        let net = Network::with_options(shell.clone(), options);
        let name = net.cgroup("cg").unwrap();

        net.cgroup_add(&name, CGroupLimits::default(), &[]).unwrap();
        std::fs::create_dir(root.path().join(name.scoped())).unwrap();
        shell.fail_on("rmdir");

        assert!(net.cgroup_delete(&name).is_err());
        assert_eq!(net.live_cgroups(), vec![name.clone()]);
        assert_eq!(net.pending_cleanups(), 1);

        shell.clear_failures();
        net.cgroup_delete(&name).unwrap();
        assert!(net.live_cgroups().is_empty());
        assert_eq!(net.pending_cleanups(), 0);
    }

    #[test]
    fn test_netns_delete_invalidates_scope() {
        let (shell, net) = network();
        let ns = net.namespace("ns0").unwrap();
        let p0 = net.interface("p0").unwrap();
        let p1 = net.interface("p1").unwrap();

        net.link_veth_add(&p0, &p1).unwrap();
        let inner = net.netns_add(&ns).unwrap();
        net.link_set(&ns, &p1).unwrap();
        inner.addr_add("10.0.0.2/24", &p1).unwrap();
        let nested = net.namespace("nested").unwrap();
        inner.netns_add(&nested).unwrap();
        assert_eq!(net.pending_cleanups(), 5);

        net.netns_delete(&ns).unwrap();

        // veth deletion and the nested namespace survive
        assert_eq!(net.pending_cleanups(), 2);
        assert_eq!(net.live_namespaces(), vec![nested]);

        let before = shell.calls().len();
        net.cleanup().unwrap();
        let undo = shell.calls()[before..].to_vec();
        assert_eq!(
            undo,
            vec![
                "ip netns pids n-2-nested",
                "ip netns delete n-2-nested",
                "ip link delete n-2-p0",
            ]
        );
    }

    #[test]
    fn test_link_set_moves_back_to_origin() {
        let (shell, net) = network();
        let ns0 = net.namespace("ns0").unwrap();
        let ns1 = net.namespace("ns1").unwrap();
        let p0 = net.interface("p0").unwrap();

        let inner0 = net.netns_add(&ns0).unwrap();
        net.netns_add(&ns1).unwrap();
        net.link_set(&ns0, &p0).unwrap();
        inner0.link_set(&ns1, &p0).unwrap();

        let before = shell.calls().len();
        net.cleanup().unwrap();
        let undo = shell.calls()[before..].to_vec();

        assert_eq!(undo[0], "ip netns exec n-2-ns1 ip link set n-2-p0 netns n-2-ns0");
        assert_eq!(undo[1], "ip netns exec n-2-ns0 ip link set n-2-p0 netns 1");
    }

    #[test]
    fn test_tc_adds_then_changes() {
        let (shell, net) = network();
        let p0 = net.interface("p0").unwrap();
        let netem = Netem {
            delay_ms: Some(20),
            loss_percent: Some(1.5),
            rate_mbit: Some(10),
            limit: None,
        };

        net.tc(&p0, netem).unwrap();
        shell.respond("tc qdisc show", "qdisc netem 8001: root refcnt 2 limit 1000");
        net.tc(&p0, Netem::default()).unwrap();

        assert_eq!(
            shell.calls_matching("root netem"),
            vec![
                "tc qdisc add dev n-2-p0 root netem delay 20ms loss 1.5% rate 10Mbit",
                "tc qdisc change dev n-2-p0 root netem",
            ]
        );
        assert_eq!(net.pending_cleanups(), 1);
    }

    #[test]
    fn test_iptables_rules_are_removed() {
        let (shell, net) = network();
        let p0 = net.interface("p0").unwrap();
        let p1 = net.interface("p1").unwrap();

        net.forward(&p0, &p1).unwrap();
        net.nat("10.0.0.0/24", &p0).unwrap();
        net.cleanup().unwrap();

        assert_eq!(
            shell.calls_matching("iptables"),
            vec![
                "iptables -A FORWARD -o n-2-p0 -i n-2-p1 -j ACCEPT",
                "iptables -t nat -A POSTROUTING -s 10.0.0.0/24 -o n-2-p0 -j MASQUERADE",
                "iptables -t nat -D POSTROUTING -s 10.0.0.0/24 -o n-2-p0 -j MASQUERADE",
                "iptables -D FORWARD -o n-2-p0 -i n-2-p1 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_link_delete_drops_compensations() {
        let (_shell, net) = network();
        let p0 = net.interface("p0").unwrap();
        let p1 = net.interface("p1").unwrap();
        net.link_veth_add(&p0, &p1).unwrap();
        net.up(&p0).unwrap();

        net.link_delete(&p0).unwrap();
        assert_eq!(net.pending_cleanups(), 0);
    }

    #[test]
    fn test_parse_link_names() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
3: n-2-p0@n-2-p1: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN
    link/ether 6e:3a:91:12:ab:cd brd ff:ff:ff:ff:ff:ff
";
        assert_eq!(parse_link_names(output), vec!["lo", "n-2-p0"]);
    }

    #[test]
    fn test_link_list_and_netns_list() {
        let (shell, net) = network();
        shell.respond(
            "type bridge",
            "7: n-2-br1: <BROADCAST>\n5: n-2-br0: <BROADCAST>\n",
        );
        shell.respond("ip netns list", "n-2-ns1 (id: 1)\nn-2-ns0 (id: 0)\n");

        assert_eq!(net.bridge_list().unwrap(), vec!["n-2-br0", "n-2-br1"]);
        assert_eq!(net.netns_list().unwrap(), vec!["n-2-ns1", "n-2-ns0"]);
    }

    #[test]
    fn test_sbin_fallback() {
        let (shell, net) = network();
        let ns = net.namespace("ns0").unwrap();
        let p0 = net.interface("p0").unwrap();
        let inner = net.netns_add(&ns).unwrap();

        shell.fail_with(
            "n-2-ns0 tc qdisc",
            "exec of \"tc\" failed: No such file or directory\n",
        );
        inner.tc_show(&p0).unwrap();
        assert_eq!(
            shell.calls_matching("/usr/sbin"),
            vec!["ip netns exec n-2-ns0 /usr/sbin/tc qdisc show dev n-2-p0"]
        );

        // Other failures are not retried
        shell.clear_failures();
        shell.fail_on("tc qdisc show");
        assert!(inner.tc_show(&p0).is_err());
        assert_eq!(shell.calls_matching("/usr/sbin").len(), 1);
    }
}
