//! Line parsers for the metadata dump formats.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use dpf_core::correlate::{DmaOp, DtuOp, RuntimeTask, TaskError, TaskTable};
use dpf_core::timeline::HostTimepoint;

use crate::LoadError;

/// Non-blank lines, numbered from 1.
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end()))
        .filter(|(_, line)| !line.trim().is_empty())
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> LoadError {
    LoadError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn number<T>(path: &Path, line: usize, what: &str, field: &str) -> Result<T, LoadError>
where
    T: FromStr,
    T::Err: Display,
{
    field
        .parse()
        .map_err(|e| parse_error(path, line, format!("invalid {what} {field:?}: {e}")))
}

fn hex_u64(path: &Path, line: usize, what: &str, field: &str) -> Result<u64, LoadError> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u64::from_str_radix(digits, 16).map_err(|e| parse_error(path, line, format!("invalid {what} {field:?}: {e}")))
}

/// Splits on runs of spaces into at most `count` fields; the last one keeps
/// the rest of the line.
pub(crate) fn split_fields(line: &str, count: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start_matches(' ');
    while !rest.is_empty() {
        if fields.len() + 1 == count {
            fields.push(rest.trim_end_matches(' '));
            break;
        }
        match rest.split_once(' ') {
            Some((head, tail)) => {
                fields.push(head);
                rest = tail.trim_start_matches(' ');
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}

/// Whitespace fields of a DMA dump line. A token ending in `,` absorbs the
/// next one, and `sip launch` is a single engine name.
pub(crate) fn dma_fields(line: &str) -> Vec<String> {
    let mut joined: Vec<String> = Vec::new();
    for token in line.split_whitespace() {
        match joined.last_mut() {
            Some(last) if last.ends_with(',') => last.push_str(token),
            _ => joined.push(token.to_string()),
        }
    }

    let mut fields = Vec::with_capacity(joined.len());
    let mut tokens = joined.into_iter().peekable();
    while let Some(token) = tokens.next() {
        if token == "sip" && tokens.peek().is_some_and(|next| next == "launch") {
            tokens.next();
            fields.push("sip launch".to_string());
        } else {
            fields.push(token);
        }
    }
    fields
}

/// `task_id exec_uuid_hex pg_mask`. Lines without a numeric task id (such
/// as headers) are skipped.
pub(crate) fn tasks(path: &Path, text: &str) -> Result<TaskTable, LoadError> {
    let mut table = TaskTable::new();
    for (line_no, line) in lines(text) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(Ok(task_id)) = fields.first().map(|f| f.parse::<u64>()) else {
            tracing::warn!(path = %path.display(), line = line_no, text = line, "skipping task line");
            continue;
        };
        let [_, exec, mask] = fields[..] else {
            return Err(parse_error(
                path,
                line_no,
                format!("expected 3 fields, found {}", fields.len()),
            ));
        };
        let exec_uuid = hex_u64(path, line_no, "executable uuid", exec)?;
        let pg_mask = number(path, line_no, "pg mask", mask)?;
        if let Err(TaskError::DuplicateTask(id)) = table.insert(RuntimeTask::new(task_id, exec_uuid, pg_mask)) {
            return Err(LoadError::Duplicate {
                path: path.to_path_buf(),
                line: line_no,
                what: "task id",
                id,
            });
        }
    }
    Ok(table)
}

/// `cluster_id host_time sync_index`.
pub(crate) fn timepoints(path: &Path, text: &str) -> Result<Vec<HostTimepoint>, LoadError> {
    lines(text)
        .map(|(line_no, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [cluster, host_time, sync] = fields[..] else {
                return Err(parse_error(
                    path,
                    line_no,
                    format!("expected 3 fields, found {}", fields.len()),
                ));
            };
            Ok(HostTimepoint {
                cluster_id: number(path, line_no, "cluster id", cluster)?,
                host_time: number(path, line_no, "host time", host_time)?,
                sync_index: number(path, line_no, "sync index", sync)?,
            })
        })
        .collect()
}

/// `packet_id op_id`.
pub(crate) fn packet_map(path: &Path, text: &str) -> Result<HashMap<u32, u32>, LoadError> {
    let mut map = HashMap::new();
    for (line_no, line) in lines(text) {
        let fields = split_fields(line, 3);
        let (Some(pkt), Some(op)) = (fields.first(), fields.get(1)) else {
            return Err(parse_error(path, line_no, "expected packet and op ids"));
        };
        let packet_id: u32 = number(path, line_no, "packet id", pkt)?;
        let op_id = number(path, line_no, "op id", op)?;
        if map.insert(packet_id, op_id).is_some() {
            return Err(LoadError::Duplicate {
                path: path.to_path_buf(),
                line: line_no,
                what: "packet id",
                id: packet_id.into(),
            });
        }
    }
    Ok(map)
}

/// `op_id op_name [detail]`.
pub(crate) fn dtu_ops(path: &Path, text: &str) -> Result<Vec<DtuOp>, LoadError> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for (line_no, line) in lines(text) {
        let fields = split_fields(line, 3);
        let (Some(id), Some(name)) = (fields.first(), fields.get(1)) else {
            return Err(parse_error(path, line_no, "expected op id and name"));
        };
        let op_id: u32 = number(path, line_no, "op id", id)?;
        if !seen.insert(op_id) {
            return Err(LoadError::Duplicate {
                path: path.to_path_buf(),
                line: line_no,
                what: "op id",
                id: op_id.into(),
            });
        }
        ops.push(DtuOp {
            op_id,
            op_name: (*name).to_string(),
            detail: fields.get(2).map(ToString::to_string).unwrap_or_default(),
        });
    }
    Ok(ops)
}

/// `packet_id dma_op engine_type engine_index input output [attrs]`.
pub(crate) fn dma_ops(path: &Path, text: &str) -> Result<Vec<DmaOp>, LoadError> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for (line_no, line) in lines(text) {
        let mut fields = dma_fields(line).into_iter();
        let (Some(pkt), Some(dma_op), Some(engine_type), Some(index), Some(input), Some(output)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(parse_error(path, line_no, "expected at least 6 fields"));
        };
        let packet_id: u32 = number(path, line_no, "packet id", &pkt)?;
        if !seen.insert(packet_id) {
            return Err(LoadError::Duplicate {
                path: path.to_path_buf(),
                line: line_no,
                what: "packet id",
                id: packet_id.into(),
            });
        }
        ops.push(DmaOp {
            packet_id,
            dma_op,
            engine_type,
            engine_index: number(path, line_no, "engine index", &index)?,
            input,
            output,
            attrs: fields.next().unwrap_or_default(),
        });
    }
    Ok(ops)
}
