#![warn(missing_docs)]
//! Lists host interfaces with their state, IPv4 address and netmask.

use clap::Parser;
use fsxrpc_net::{enumerate_interfaces, query_interface, InterfaceInfo};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fsx-ifconf", about = "Show network interfaces as seen by the fsxrpc transport")]
struct Args {
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Only show interfaces that are up.
    #[arg(long)]
    up: bool,
}

#[derive(Serialize)]
struct Row {
    name: String,
    #[serde(flatten)]
    info: InterfaceInfo,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut rows = Vec::new();
    for name in enumerate_interfaces()? {
        let info = query_interface(&name)?;
        if args.up && !info.up {
            continue;
        }
        rows.push(Row { name, info });
    }
    tracing::debug!(count = rows.len(), "enumerated interfaces");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in &rows {
        println!(
            "{:<16} {:<5} {:<15} {}",
            row.name,
            if row.info.up { "up" } else { "down" },
            row.info.ip_addr(),
            row.info.netmask()
        );
    }
    Ok(())
}
