use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use tracing::{info, warn};

use netlab_core::application::{Netem, Network};
use netlab_core::domain::RunRecord;
use netlab_core::port::RunOptions;

use crate::output;
use crate::App;

const LEFT_ADDR: &str = "10.0.0.1/24";
const RIGHT_ADDR: &str = "10.0.0.2/24";
const RIGHT_IP: &str = "10.0.0.2";

/// Two namespaces joined by a veth pair, pinged across, then removed
///
/// Cleanup runs whatever happened while building or pinging; both outcomes
/// are reported.
pub fn demo(app: &App, count: u32, delay_ms: Option<u32>, loss: Option<f64>) -> Result<()> {
    let network = Network::with_options(app.shell(true), app.settings.network_options());
    let netem = Netem {
        delay_ms,
        loss_percent: loss,
        ..Netem::default()
    };

    let outcome = ping_across(&network, count, netem);
    let cleaned = network.cleanup();

    match &outcome {
        Ok(record) => {
            println!("{}", record.stdout);
            println!("{}", "✓ Ping across the veth pair succeeded".green().bold());
        }
        Err(err) => {
            if let Some(record) = err.record() {
                output::print_record(record);
            }
            output::print_failure(err);
        }
    }
    match &cleaned {
        Ok(()) => println!("{}", "✓ Topology removed".green()),
        Err(err) => {
            warn!(error = %err, "Cleanup failed");
            output::print_failure(err);
        }
    }

    outcome?;
    cleaned?;
    Ok(())
}

fn ping_across(network: &Network, count: u32, netem: Netem) -> netlab_core::Result<RunRecord> {
    let left_ns = network.namespace("left")?;
    let right_ns = network.namespace("right")?;
    let left = network.netns_add(&left_ns)?;
    let right = network.netns_add(&right_ns)?;

    let p0 = network.interface("p0")?;
    let p1 = network.interface("p1")?;
    let lo = network.interface("lo")?;

    network.link_veth_add(&p0, &p1)?;
    network.link_set(&left_ns, &p0)?;
    network.link_set(&right_ns, &p1)?;

    for (side, interface, addr) in [(&left, &p0, LEFT_ADDR), (&right, &p1, RIGHT_ADDR)] {
        side.addr_add(addr, interface)?;
        side.up(interface)?;
        side.up(&lo)?;
    }

    if netem != Netem::default() {
        left.tc(&p0, netem)?;
    }
    info!(left = %left_ns, right = %right_ns, "Topology ready");

    let timeout = Duration::from_secs(u64::from(count) * 2 + 5);
    let record = left.run(
        &format!("ping -c {} -i 0.2 -W 1 {}", count, RIGHT_IP),
        RunOptions::new().timeout(timeout),
    )?;
    let summary = format!("{} packets transmitted*", count);
    record.match_output(Some(summary.as_str()), None)?;
    Ok(record)
}
