//! usb-redirector
//!
//! Runs the redirection filter against the host's live USB topology: every
//! bus is mirrored as a root hub, a filter is attached to each, and the
//! bus relations the filters export are printed.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use filter::config::{self, FilterConfig};
use filter::host::{HostTopology, scan_host};
use filter::pnp::{DeviceObject, InMemoryStack};
use filter::{ControlHandle, ControlSlot, FilterDevice, FilterError, PolicyEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-redirector")]
#[command(
    author,
    version,
    about = "USB redirection filter - expose selected devices through raw redirector nodes"
)]
#[command(long_about = "
Attaches the redirection filter to every USB bus of this host and shows which
devices are exposed natively and which through a redirector node.

EXAMPLES:
    # Watch the topology with default config
    usb-redirector

    # Run with custom config
    usb-redirector --config /path/to/filter.toml

    # Reconcile once, print and exit
    usb-redirector --list-devices

    # Run with debug logging
    usb-redirector --log-level debug

CONFIGURATION:
    The filter looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-redirector/filter.toml
    3. /etc/usb-redirector/filter.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Reconcile once, list devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Filters attached so far, by root hub
type Filters = BTreeMap<DeviceObject, FilterDevice>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = FilterConfig::default();
        let path = FilterConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        FilterConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.filter.log_level);
    setup_logging(log_level, config.filter.log_format).context("Failed to setup logging")?;

    info!("usb-redirector v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let usb = rusb::Context::new().context("Failed to initialize libusb")?;
    let stack = Arc::new(InMemoryStack::new());
    let slot = ControlSlot::new(PolicyEngine::new(config.policy.clone()));
    let control = slot.reference();

    let mut host = HostTopology::new(stack.clone());
    let mut filters = Filters::new();

    refresh(&usb, &mut host).await?;
    attach_filters(&stack, &host, &slot, &config, &mut filters);
    reconcile_all(&stack, &filters).await;

    print_topology(&control);
    let result = if args.list_devices {
        Ok(())
    } else {
        watch(&usb, &stack, &mut host, &slot, &config, &mut filters, &control).await
    };

    info!("Detaching {} filter(s)...", filters.len());
    drop(filters);
    control.release();

    result
}

/// Rescan the host off the async runtime and mirror the result
async fn refresh(usb: &rusb::Context, host: &mut HostTopology) -> Result<bool> {
    let usb = usb.clone();
    let devices = tokio::task::spawn_blocking(move || scan_host(&usb))
        .await
        .context("Host scan task failed")?
        .context("Failed to enumerate USB devices")?;
    Ok(host.apply(&devices))
}

fn attach_filters(
    stack: &Arc<InMemoryStack>,
    host: &HostTopology,
    slot: &ControlSlot,
    config: &FilterConfig,
    filters: &mut Filters,
) {
    for hub in host.hubs() {
        if filters.contains_key(&hub) {
            continue;
        }
        match FilterDevice::create(stack.clone(), hub, slot, &config.filter) {
            Ok(filter) => {
                filters.insert(hub, filter);
            }
            Err(FilterError::NotSupported(_)) => debug!("Skipping {}: not a root hub", hub),
            Err(e) => error!("Failed to attach filter to {}: {}", hub, e),
        }
    }
}

/// Query bus relations of every filtered hub, one pass each
async fn reconcile_all(stack: &InMemoryStack, filters: &Filters) {
    for hub in filters.keys() {
        match stack.query_bus_relations(*hub).await {
            Ok(outcome) => debug!(
                "Hub {} exports {} device(s)",
                hub,
                outcome.relations.map(|r| r.len()).unwrap_or(0)
            ),
            Err(e) => warn!("Bus relations query on {} failed: {}", hub, e),
        }
    }
}

async fn watch(
    usb: &rusb::Context,
    stack: &Arc<InMemoryStack>,
    host: &mut HostTopology,
    slot: &ControlSlot,
    config: &FilterConfig,
    filters: &mut Filters,
    control: &ControlHandle,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(config.host.poll_interval_ms));
    info!("Watching USB topology, press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match refresh(usb, host).await {
                    Ok(true) => {
                        attach_filters(stack, host, slot, config, filters);
                        reconcile_all(stack, filters).await;
                        print_topology(control);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Topology refresh failed: {:#}", e),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}

fn print_topology(control: &ControlHandle) {
    let children = control.enumerate_children();

    if children.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", children.len());
    for child in children {
        println!(
            "  [{}] {} {}",
            child.pdo,
            child.device_id,
            child.instance_id
        );
        match child.redirector {
            Some(redirector) => println!("      Redirected via {} (filter {})", redirector, child.filter),
            None => println!("      Native (filter {})", child.filter),
        }
        println!();
    }
}
