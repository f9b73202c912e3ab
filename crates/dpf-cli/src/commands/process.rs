//! Process command for running the full reconstruction pipeline.

use std::io::Write;

use anyhow::{Context, Result};

use dpf_core::{Session, SessionConfig, SessionReport, Topology};
use dpf_load::MetaDirLoader;

pub fn run<W: Write>(
    writer: &mut W,
    bytes: &[u8],
    topology: &Topology,
    loader: &MetaDirLoader,
    config: SessionConfig,
    json: bool,
) -> Result<()> {
    let report = Session::new(topology, config)
        .run(bytes, loader)
        .with_context(|| format!("failed to process trace with metadata from {}", loader.dir().display()))?;

    if json {
        serde_json::to_writer_pretty(&mut *writer, &report).context("failed to serialize report")?;
        writeln!(writer)?;
    } else {
        write_summary(writer, &report)?;
    }
    Ok(())
}

/// Human-readable digest of a session.
pub fn write_summary<W: Write>(writer: &mut W, report: &SessionReport) -> Result<()> {
    writeln!(writer, "{:<12} {}", "decode", report.decode)?;
    writeln!(writer, "pairing")?;
    for s in &report.pairing {
        writeln!(writer, "  {:<12} {}", s.detector, s.stats)?;
    }
    let launches = &report.launches;
    writeln!(
        writer,
        "{:<12} applied={} unknown={} repeated={}",
        "launches", launches.applied, launches.unknown, launches.repeated
    )?;
    writeln!(writer, "{:<12} {}", "executables", report.executables)?;

    let correlation = &report.correlation;
    writeln!(writer, "{:<12} {}", "ops", correlation.stats)?;
    for c in &correlation.coverage {
        writeln!(
            writer,
            "  task {} exec {:#018x} matched={} missed={}",
            c.task_id, c.exec_uuid, c.matched, c.missed
        )?;
    }
    writeln!(writer, "{:<12} {}", "spans", correlation.spans.len())?;
    writeln!(writer, "{:<12} {}", "dma", report.dma.len())?;
    writeln!(writer, "{:<12} {}", "kernels", report.kernels.len())?;
    writeln!(writer, "{:<12} {}", "firmware", report.firmware.len())?;

    match &report.timeline {
        Some(timeline) => writeln!(
            writer,
            "{:<12} points={} mapped={} unmappable={}",
            "timeline",
            timeline.points().len(),
            report.timeline_stats.mapped,
            report.timeline_stats.unmappable
        )?,
        None => writeln!(writer, "{:<12} none", "timeline")?,
    }
    Ok(())
}
