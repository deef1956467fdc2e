use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod clock;
mod encap;
mod flow_key;
mod gk;
mod lls;
mod mailbox;
mod nic;
mod packet;
mod rss;

use clock::{Clock, SystemClock};
use gk::policy::PolicyCommand;
use gk::GkWorker;
use lls::{LlsCommand, LlsWorker};
use nic::{GrantorId, Interface, NicPort, PnetPort, QueueId, PortError, RouteResult, RouteTable, TunnelDescriptor, TunnelFamily};

#[derive(Debug, StructOpt)]
#[structopt(name = "floodgate", about = "GK/LLS data plane for a DoS-mitigation gateway.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/floodgate/config.yml"
    )]
    config: std::path::PathBuf,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

mod config {
    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub front_interface: String,
        pub back_interface: String,
        pub gk_worker_cores: Vec<usize>,
        pub lls_core: usize,
        pub gk_table_capacity: usize,
        pub mailbox_capacity: usize,
        #[serde(with = "humantime_serde")]
        pub arp_timeout: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub nd_timeout: std::time::Duration,
        pub upstream_grantor: String,
        pub upstream_tunnel_dst: String,
    }

    // An internal configuration structure used by the rest of the program
    // that can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub front_interface: String,
        pub back_interface: String,
        pub gk_worker_cores: Vec<usize>,
        pub lls_core: usize,
        pub gk_table_capacity: usize,
        pub mailbox_capacity: usize,
        pub arp_timeout: std::time::Duration,
        pub nd_timeout: std::time::Duration,
        pub upstream_grantor: u32,
        pub upstream_tunnel_dst: std::net::IpAddr,
    }
}

/// A minimal stand-in for the LPM route lookup the core treats as an
/// opaque external collaborator (spec.md §6): every flow resolves to the
/// single configured upstream Grantor and tunnel endpoint. A deployment
/// with more than one Grantor replaces this with a real LPM-backed
/// implementation of `RouteTable`.
struct StaticRouteTable {
    grantor: GrantorId,
    tunnel: TunnelDescriptor,
}

impl RouteTable for StaticRouteTable {
    fn route_lookup(&self, _dst: IpAddr) -> Option<RouteResult> {
        Some(RouteResult {
            grantor: self.grantor,
            tunnel: self.tunnel.clone(),
        })
    }
}

fn interface_from_datalink(name: &str) -> Result<Interface, PortError> {
    let found = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| PortError::NoSuchInterface(name.to_owned()))?;

    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    for network in &found.ips {
        match network.ip() {
            IpAddr::V4(v4) => ipv4.push(v4),
            IpAddr::V6(v6) => ipv6.push(v6),
        }
    }

    Ok(Interface {
        name: found.name,
        mac: found.mac.unwrap_or(pnet_packet::util::MacAddr::new(0, 0, 0, 0, 0, 0)),
        ipv4,
        ipv6,
    })
}

fn main() {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    let opt = Opt::from_args();

    // Setup slog terminal logging
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let mut log_level = Level::Info;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    );

    slog::info!(root_log, "Arguments {:?}", opt);

    // Read the configuration file
    let config_string = std::fs::read_to_string(&opt.config).expect("Failed to read config file");
    let parsed_config_version: config::Version =
        serde_yaml::from_str(&config_string).expect("Failed to extract version from config file");
    slog::debug!(
        root_log,
        "Parsed the config version {:?}",
        parsed_config_version
    );
    let config_version = parsed_config_version.version.unwrap_or(1);

    let config = match config_version {
        1 => {
            let parsed_config: config::V1 =
                serde_yaml::from_str(&config_string).expect("Failed to parse config");
            slog::debug!(root_log, "Parsed config {:?}", parsed_config);
            config::Internal {
                front_interface: parsed_config.front_interface,
                back_interface: parsed_config.back_interface,
                gk_worker_cores: parsed_config.gk_worker_cores,
                lls_core: parsed_config.lls_core,
                gk_table_capacity: parsed_config.gk_table_capacity,
                mailbox_capacity: parsed_config.mailbox_capacity,
                arp_timeout: parsed_config.arp_timeout,
                nd_timeout: parsed_config.nd_timeout,
                upstream_grantor: u32::from_str(&parsed_config.upstream_grantor)
                    .expect("Failed to parse configured grantor id"),
                upstream_tunnel_dst: IpAddr::from_str(&parsed_config.upstream_tunnel_dst)
                    .expect("Failed to parse configured tunnel destination"),
            }
        }
        _ => {
            slog::error!(
                root_log,
                "Unsupported configuration version '{}' specified",
                config_version
            );
            panic!("Unsupported configuration version specified");
        }
    };

    let config = Arc::new(config);

    let front_iface = interface_from_datalink(&config.front_interface)
        .expect("Failed to resolve the front interface");
    let back_iface = interface_from_datalink(&config.back_interface)
        .expect("Failed to resolve the back interface");

    let tunnel_family = match config.upstream_tunnel_dst {
        IpAddr::V4(_) => TunnelFamily::V4,
        IpAddr::V6(_) => TunnelFamily::V6,
    };
    let routes = Arc::new(StaticRouteTable {
        grantor: GrantorId(config.upstream_grantor),
        tunnel: TunnelDescriptor {
            family: tunnel_family,
            outer_dst: config.upstream_tunnel_dst,
        },
    });

    let exiting = Arc::new(AtomicBool::new(false));

    // Each GK worker below clones `lls_tx` to submit HOLD requests for
    // next-hop link-layer addresses; resolutions come back on its own
    // per-worker `ResolutionEvent` mailbox (gk::ResolutionEvent), never
    // through this one.
    let (lls_tx, lls_rx) = mailbox::with_capacity::<LlsCommand>(config.mailbox_capacity);
    let lls_front_iface = front_iface.clone();
    let lls_back_iface = back_iface.clone();
    let lls_logger = root_log.new(slog::o!("worker" => "lls"));
    let lls_core = config.lls_core;
    let lls_exiting = exiting.clone();
    let arp_timeout_secs = config.arp_timeout.as_secs().max(1);
    let nd_timeout_secs = config.nd_timeout.as_secs().max(1);
    let front_name_for_lls = config.front_interface.clone();
    let back_name_for_lls = config.back_interface.clone();

    let lls_handle = std::thread::Builder::new()
        .name("floodgate-lls".to_owned())
        .spawn(move || {
            if let Some(core_ids) = core_affinity::get_core_ids() {
                if let Some(core) = core_ids.into_iter().find(|c| c.id == lls_core) {
                    core_affinity::set_for_current(core);
                }
            }

            let mut worker = LlsWorker::new(
                lls_front_iface,
                Some(lls_back_iface),
                lls_rx,
                arp_timeout_secs,
                nd_timeout_secs,
                lls_logger.clone(),
            );

            let mut front_port = PnetPort::bind(&front_name_for_lls, QueueId(0), QueueId(0))
                .expect("Failed to bind the front interface for the LLS worker");
            let mut back_port = PnetPort::bind(&back_name_for_lls, QueueId(0), QueueId(0))
                .expect("Failed to bind the back interface for the LLS worker");
            let clock = SystemClock::default();

            while !lls_exiting.load(Ordering::Relaxed) {
                let now = clock.now();
                let (front_tx, back_tx) =
                    worker.run_once(now, &mut front_port, Some(&mut back_port));
                if !front_tx.is_empty() {
                    front_port.tx_burst(&front_tx);
                }
                if !back_tx.is_empty() {
                    back_port.tx_burst(&back_tx);
                }
            }
        })
        .expect("Failed to spawn the LLS worker thread");

    let mut gk_handles = Vec::new();
    for &core in &config.gk_worker_cores {
        let (_policy_tx, policy_rx) = mailbox::with_capacity::<PolicyCommand>(config.mailbox_capacity);
        let front_name = config.front_interface.clone();
        let back_name = config.back_interface.clone();
        let table_capacity = config.gk_table_capacity;
        let worker_logger = root_log.new(slog::o!("worker" => "gk", "core" => core));
        let worker_exiting = exiting.clone();
        let worker_routes = routes.clone();
        let worker_back_iface = back_iface.clone();
        let worker_lls_tx = lls_tx.clone();

        let handle = std::thread::Builder::new()
            .name(format!("floodgate-gk-{}", core))
            .spawn(move || {
                if let Some(core_ids) = core_affinity::get_core_ids() {
                    if let Some(target) = core_ids.into_iter().find(|c| c.id == core) {
                        core_affinity::set_for_current(target);
                    }
                }

                let mut worker = GkWorker::new(
                    core,
                    table_capacity,
                    policy_rx,
                    SystemClock::default(),
                    worker_back_iface,
                    worker_lls_tx,
                    worker_logger,
                );

                let mut front_port = PnetPort::bind(&front_name, QueueId(core as u16), QueueId(core as u16))
                    .expect("Failed to bind the front interface for a GK worker");
                let mut back_port = PnetPort::bind(&back_name, QueueId(core as u16), QueueId(core as u16))
                    .expect("Failed to bind the back interface for a GK worker");

                while !worker_exiting.load(Ordering::Relaxed) {
                    let outgoing = worker.run_once(&mut front_port, worker_routes.as_ref());
                    if !outgoing.is_empty() {
                        back_port.tx_burst(&outgoing);
                    }
                }
            })
            .expect("Failed to spawn a GK worker thread");
        gk_handles.push(handle);
    }

    slog::info!(root_log, "floodgate is running; press enter to stop");
    let mut discard = String::new();
    let _ = std::io::stdin().read_line(&mut discard);
    exiting.store(true, Ordering::Relaxed);

    for handle in gk_handles.into_iter().rev() {
        let _ = handle.join();
    }
    let _ = lls_handle.join();
}
