//! Topology command for dumping an architecture's master-value table.

use std::io::Write;

use anyhow::Result;

use dpf_core::Topology;

pub fn run<W: Write>(writer: &mut W, topology: &Topology) -> Result<()> {
    let layout = topology.layout();
    writeln!(writer, "arch: {}", topology.arch())?;
    writeln!(
        writer,
        "layout: clusters={} cqm={} sip={} sdma={} cdma={}",
        layout.clusters, layout.cqm_per_cluster, layout.sip_per_cluster, layout.sdma_per_cluster, layout.cdma_per_cluster
    )?;
    writeln!(writer, "cluster  hi  lo  unique  engine")?;
    for entry in topology.entries() {
        writeln!(
            writer,
            "{:>7} {:>3} {:>3} {:>#7x}  {} {}",
            entry.cluster,
            entry.master_hi,
            entry.master_lo,
            entry.unique_index(),
            entry.engine_type,
            entry.engine_index
        )?;
    }
    Ok(())
}
