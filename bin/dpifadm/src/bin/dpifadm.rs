// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use clap::Parser;
use slog::Drain;
use slog::Logger;
use slog::o;

use dpif_api::ACTION_LEN;
use dpif_api::ACTIONS_LEN;
use dpif_api::API_VERSION;
use dpif_api::FLOW_KEY_LEN;
use dpif_api::FLOW_STATS_LEN;
use dpif_api::FlowMessage;
use dpif_api::MAX_ACTIONS;
use dpif_api::MESSAGE_SIZE;
use dpif_api::PacketMessage;
use dpif_api::Upcall;
use dpif_api::VPORT_STATS_LEN;
use dpif_api::VportMessage;
use dpif_api::WireMsg;
use dpif_client::print::print_flows;
use dpif_client::print::print_ports;
use dpifadm::DpifAdm;
use dpifadm::scenario::Scenario;

/// Administer a dpif datapath
#[derive(Debug, Parser)]
#[command(version = dpif_pkg_version())]
enum Command {
    /// Start an in-process datapath, apply a scenario file to it, and
    /// print the resulting port and flow tables.
    Run {
        /// Path to the scenario TOML file.
        scenario: PathBuf,
    },

    /// Print the wire size of each message.
    Sizes,
}

fn dpif_pkg_version() -> String {
    format!("{}.{API_VERSION}", env!("CARGO_PKG_VERSION"))
}

/// A terminal logger filtered by `RUST_LOG`.
fn term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn print_sizes() {
    println!("{:<16} {:>6}", "ITEM", "BYTES");
    let rows = [
        ("flow key", FLOW_KEY_LEN),
        ("action slot", ACTION_LEN),
        ("action list", ACTIONS_LEN),
        ("vport stats", VPORT_STATS_LEN),
        ("flow stats", FLOW_STATS_LEN),
        ("vport message", VportMessage::WIRE_LEN),
        ("flow message", FlowMessage::WIRE_LEN),
        ("packet message", PacketMessage::WIRE_LEN),
        ("envelope", MESSAGE_SIZE),
        ("upcall", Upcall::WIRE_LEN),
    ];
    for (item, len) in rows {
        println!("{item:<16} {len:>6}");
    }
    println!("\n{MAX_ACTIONS} action slots per list");
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::Run { scenario } => {
            let log = term_logger();
            let sc = Scenario::load(&scenario)?;
            let (link, dp, engine) =
                dpif_engine::spawn(sc.engine.clone(), &log)?;
            let adm = DpifAdm::new(link, log.new(o!("component" => "adm")));

            let ports = adm.apply(&sc)?;
            let replay = adm.replay(&sc, &ports, &dp)?;

            print_ports(&adm.ports()?)?;
            println!();
            print_flows(&adm.flows()?)?;

            let stats = dp.stats();
            println!(
                "\ninjected: {} hit, {} upcall, {} lost, {} no port",
                replay.hits, replay.upcalls, replay.lost, replay.no_port
            );
            println!(
                "datapath: {} hits, {} misses, {} lost",
                stats.hits, stats.misses, stats.lost
            );

            drop(adm);
            engine
                .join()
                .map_err(|_| anyhow::anyhow!("datapath thread panicked"))?;
        }

        Command::Sizes => print_sizes(),
    }

    Ok(())
}
