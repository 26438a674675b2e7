// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print dump results in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both dpifadm and integration tests.

use dpif_api::FlowMessage;
use dpif_api::VportMessage;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a list of vports.
pub fn print_ports(ports: &[VportMessage]) -> std::io::Result<()> {
    print_ports_into(&mut std::io::stdout(), ports)
}

/// Print a list of vports.
pub fn print_ports_into(
    writer: &mut impl Write,
    ports: &[VportMessage],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "PORT\tNAME\tTYPE\tRX\tTX\tRX_BYTES\tTX_BYTES\tRX_DROP")?;
    for p in ports {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            p.port_no,
            p.name,
            p.vport_type,
            p.stats.rx,
            p.stats.tx,
            p.stats.rx_bytes,
            p.stats.tx_bytes,
            p.stats.rx_drop,
        )?;
    }
    t.flush()
}

/// Print a list of flows.
pub fn print_flows(flows: &[FlowMessage]) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), flows)
}

/// Print a list of flows.
pub fn print_flows_into(
    writer: &mut impl Write,
    flows: &[FlowMessage],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "KEY\tPACKETS\tBYTES\tUSED\tFLAGS\tACTIONS")?;
    for f in flows {
        let used = match f.stats.used {
            0 => "never".to_string(),
            ms => format!("{ms}ms"),
        };
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            f.key,
            f.stats.packet_count,
            f.stats.byte_count,
            used,
            f.stats.tcp_flags,
            f.actions,
        )?;
    }
    t.flush()
}

#[cfg(test)]
mod test {
    use super::*;
    use dpif_api::Action;
    use dpif_api::FlowCmd;
    use dpif_api::FlowKey;
    use dpif_api::PortName;
    use dpif_api::VportCmd;
    use dpif_api::VportType;

    #[test]
    fn port_table() {
        let port = VportMessage {
            port_no: 3,
            name: PortName::new("eth0").unwrap(),
            vport_type: VportType::Phy,
            ..VportMessage::new(VportCmd::Get)
        };

        let mut out = vec![];
        print_ports_into(&mut out, &[port]).unwrap();
        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("PORT"));
        let row = lines.next().unwrap();
        assert!(row.starts_with('3'));
        assert!(row.contains("eth0"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn flow_table() {
        let mut flow = FlowMessage::new(FlowCmd::Get, FlowKey::default());
        flow.actions.push(Action::Output { port: 2 }).unwrap();

        let mut out = vec![];
        print_flows_into(&mut out, &[flow]).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("never"));
    }
}
