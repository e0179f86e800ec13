//! Dump journal command implementation.

use cloudstore_cache::{decode_frames, CommitFrame, JournalOp};
use serde::Serialize;
use std::path::Path;

/// Summary of one commit frame.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    /// Commit sequence number.
    pub sequence: u64,
    /// Who committed.
    pub origin: String,
    /// Records written.
    pub put_records: Vec<String>,
    /// Records removed.
    pub removed_records: Vec<String>,
    /// Rows written.
    pub put_rows: usize,
    /// Rows removed.
    pub removed_rows: usize,
    /// Whether the frame replaced the sync metadata.
    pub metadata: bool,
}

impl From<&CommitFrame> for FrameInfo {
    fn from(frame: &CommitFrame) -> Self {
        let mut info = FrameInfo {
            sequence: frame.sequence,
            origin: format!("{:?}", frame.origin),
            put_records: Vec::new(),
            removed_records: Vec::new(),
            put_rows: 0,
            removed_rows: 0,
            metadata: false,
        };
        for op in &frame.ops {
            match op {
                JournalOp::PutRecord(record) => info.put_records.push(record.record_name().to_string()),
                JournalOp::RemoveRecord(name) => info.removed_records.push(name.clone()),
                JournalOp::PutRow(_) => info.put_rows += 1,
                JournalOp::RemoveRow(_) => info.removed_rows += 1,
                JournalOp::SetMetadata(_) => info.metadata = true,
            }
        }
        info
    }
}

/// Journal dump output.
#[derive(Debug, Serialize)]
pub struct DumpResult {
    /// Frames, full or summarized.
    pub frames: serde_json::Value,
    /// Bytes after the last complete frame.
    pub torn_tail: usize,
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    full: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("Journal file not found: {}", path.display()).into());
    }

    let bytes = std::fs::read(path)?;
    let (frames, covered) = decode_frames(&bytes)?;
    let frames: Vec<CommitFrame> = frames.into_iter().take(limit.unwrap_or(usize::MAX)).collect();
    let torn_tail = bytes.len() - covered;

    match format {
        "json" => {
            let frames = if full {
                serde_json::to_value(&frames)?
            } else {
                serde_json::to_value(frames.iter().map(FrameInfo::from).collect::<Vec<_>>())?
            };
            let result = DumpResult { frames, torn_tail };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&frames, torn_tail);
        }
    }

    Ok(())
}

fn print_text_output(frames: &[CommitFrame], torn_tail: usize) {
    println!("Journal Frames");
    println!("==============");
    println!();

    if frames.is_empty() {
        println!("No frames found.");
    }

    for frame in frames {
        let info = FrameInfo::from(frame);
        print!("#{:<6} {:<12}", info.sequence, info.origin);
        if !info.put_records.is_empty() {
            print!(" put={}", info.put_records.join(","));
        }
        if !info.removed_records.is_empty() {
            print!(" removed={}", info.removed_records.join(","));
        }
        if info.put_rows > 0 || info.removed_rows > 0 {
            print!(" rows=+{}/-{}", info.put_rows, info.removed_rows);
        }
        if info.metadata {
            print!(" metadata");
        }
        println!();
    }

    println!();
    println!("Total: {} frames", frames.len());
    if torn_tail > 0 {
        println!("Torn tail: {} bytes (discarded on next open)", torn_tail);
    }
}
