use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use tabled::{Table, Tabled};
use tracing::{info, warn};

use netlab_core::application::Network;
use netlab_core::domain::NamespaceName;

use crate::App;

#[derive(Tabled)]
struct SweepRow {
    namespace: String,
    uid: u32,
    action: String,
}

/// Scoped namespaces whose owning process no longer exists
///
/// Names that do not decode as scoped names belong to someone else and are
/// never touched.
fn stale_namespaces(names: &[String], is_alive: impl Fn(u32) -> bool) -> Vec<NamespaceName> {
    names
        .iter()
        .filter_map(|name| NamespaceName::parse(name).ok())
        .filter(|ns| !is_alive(ns.uid()))
        .collect()
}

fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

pub fn sweep(app: &App, dry_run: bool) -> Result<()> {
    let network = Network::with_options(app.shell(true), app.settings.network_options());
    let stale = stale_namespaces(&network.netns_list()?, process_exists);

    if stale.is_empty() {
        println!("{}", "No stale namespaces".yellow());
        return Ok(());
    }

    let mut rows = Vec::with_capacity(stale.len());
    let mut failures = 0;
    for namespace in &stale {
        let action = if dry_run {
            "would delete".to_string()
        } else {
            match network
                .netns_kill_all(namespace)
                .and_then(|_| network.netns_delete(namespace))
            {
                Ok(()) => {
                    info!(namespace = %namespace, "Stale namespace deleted");
                    "deleted".to_string()
                }
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "Could not delete namespace");
                    failures += 1;
                    format!("failed: {}", err)
                }
            }
        };
        rows.push(SweepRow {
            namespace: namespace.scoped(),
            uid: namespace.uid(),
            action,
        });
    }

    println!("{}", Table::new(rows));

    if failures > 0 {
        anyhow::bail!("{} of {} namespaces could not be deleted", failures, stale.len());
    }
    println!(
        "{}",
        format!("✓ {} stale namespace(s) handled", stale.len()).green().bold()
    );
    Ok(())
}
