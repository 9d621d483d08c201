//! Bluetooth Mesh network and transport layer tool.
//!
//! Decodes captured Network PDUs and beacons against the network described
//! in the configuration file, and prints the identifiers derived from its
//! keys.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use mesh_transport::{IvIndex, KeyRefreshPhase, MeshNetwork, Security};
use mesh_wire::Address;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod decode;
mod logging;

use config::MeshConfig;
use decode::Decoder;
use logging::MeshLogFormatter;

/// Bluetooth Mesh network and transport layer tool
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Bluetooth Mesh network and transport layer tool")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode Network PDUs given as hex; segments are reassembled in order
    Decode {
        /// One or more Network PDUs
        #[arg(required = true)]
        pdus: Vec<String>,
    },
    /// Decode a beacon given as hex
    Beacon {
        /// Beacon payload starting with the beacon type
        beacon: String,
    },
    /// Print identifiers derived from the configured keys
    Keys,
}

#[derive(Debug, Serialize)]
struct KeyReport {
    iv_index: IvIndex,
    local_address: Address,
    network_keys: Vec<NetworkKeyReport>,
    application_keys: Vec<ApplicationKeyReport>,
    groups: Vec<GroupReport>,
}

#[derive(Debug, Serialize)]
struct NetworkKeyReport {
    index: u16,
    name: String,
    phase: KeyRefreshPhase,
    min_security: Security,
    nid: u8,
    network_id: String,
    old_nid: Option<u8>,
    old_network_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApplicationKeyReport {
    index: u16,
    name: String,
    bound_network_key: u16,
    aid: u8,
    old_aid: Option<u8>,
}

#[derive(Debug, Serialize)]
struct GroupReport {
    name: String,
    address: Address,
    label: Option<Uuid>,
}

impl KeyReport {
    fn new(network: &MeshNetwork) -> Self {
        Self {
            iv_index: network.iv_index,
            local_address: network.local_address,
            network_keys: network
                .network_keys
                .iter()
                .map(|key| NetworkKeyReport {
                    index: key.index(),
                    name: key.name.clone(),
                    phase: key.phase(),
                    min_security: key.min_security,
                    nid: key.derivatives().nid,
                    network_id: hex::encode(key.derivatives().network_id),
                    old_nid: key.old_derivatives().map(|d| d.nid),
                    old_network_id: key.old_derivatives().map(|d| hex::encode(d.network_id)),
                })
                .collect(),
            application_keys: network
                .application_keys
                .iter()
                .map(|key| ApplicationKeyReport {
                    index: key.index(),
                    name: key.name.clone(),
                    bound_network_key: key.bound_network_key(),
                    aid: key.aid(),
                    old_aid: key.old_aid(),
                })
                .collect(),
            groups: network
                .groups
                .iter()
                .map(|group| GroupReport {
                    name: group.name.clone(),
                    address: group.address.address,
                    label: group.address.virtual_label,
                })
                .collect(),
        }
    }

    fn print(&self) {
        println!(
            "IV Index {:08X}{} local address {}",
            self.iv_index.index,
            if self.iv_index.update_active { " (update in progress)" } else { "" },
            self.local_address
        );
        for key in &self.network_keys {
            println!(
                "network key {:>4} {:<20} NID {:02X} Network ID {} {:?}",
                key.index, key.name, key.nid, key.network_id, key.phase
            );
            if let (Some(nid), Some(network_id)) = (key.old_nid, &key.old_network_id) {
                println!("{:>34} NID {:02X} Network ID {} (old)", "", nid, network_id);
            }
        }
        for key in &self.application_keys {
            match key.old_aid {
                Some(old) => println!(
                    "app key     {:>4} {:<20} AID {:02X} (old {:02X}) bound to {}",
                    key.index, key.name, key.aid, old, key.bound_network_key
                ),
                None => println!(
                    "app key     {:>4} {:<20} AID {:02X} bound to {}",
                    key.index, key.name, key.aid, key.bound_network_key
                ),
            }
        }
        for group in &self.groups {
            match group.label {
                Some(label) => println!("group       {} {:<20} label {}", group.address, group.name, label),
                None => println!("group       {} {}", group.address, group.name),
            }
        }
    }
}

fn parse_hex(value: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = value.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    hex::decode(digits.trim_start_matches("0x")).with_context(|| format!("invalid hex {:?}", value))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout carries decoded output only
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_transport={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting mesh tool v{}", env!("CARGO_PKG_VERSION"));

    let mesh_config = MeshConfig::load_from_file(&args.config)?;
    let network = mesh_config.network()?;
    let transport = mesh_config.transport()?;

    match args.command {
        Command::Decode { pdus } => {
            let mut decoder = Decoder::new(network, transport);
            let mut decoded = Vec::new();
            let mut failed = 0;
            for pdu in &pdus {
                match parse_hex(pdu).and_then(|raw| decoder.decode(&raw)) {
                    Ok(result) => {
                        if !args.json {
                            print!("{}", result);
                        }
                        decoded.push(result);
                    }
                    Err(e) => {
                        warn!(component = "decode", "{}: {}", pdu, e);
                        failed += 1;
                    }
                }
            }
            for source in decoder.incomplete_sources() {
                warn!(component = "decode", "segmented message from {} is incomplete", source);
            }
            if args.json {
                print_json(&decoded)?;
            }
            if failed > 0 {
                return Err(anyhow!("{} of {} PDUs could not be decoded", failed, pdus.len()));
            }
        }
        Command::Beacon { beacon } => {
            let decoder = Decoder::new(network, transport);
            let beacon = decoder.decode_beacon(&parse_hex(&beacon)?)?;
            if args.json {
                print_json(&beacon)?;
            } else {
                println!("{:#?}", beacon);
            }
        }
        Command::Keys => {
            let report = KeyReport::new(&network);
            if args.json {
                print_json(&report)?;
            } else {
                report.print();
            }
        }
    }

    Ok(())
}
