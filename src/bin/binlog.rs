//! Operator CLI over one shard's binlog directory

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ringkv::binlog::segment::{list_segments, read_entries, segment_file_name};
use ringkv::binlog::SegmentRange;
use ringkv::common::format_bytes;
use ringkv::ops::verify_log_dir;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "ringkv-binlog")]
#[command(about = "Inspect and verify a ringkv shard binlog")]
#[command(version)]
struct Cli {
    /// Binlog directory of one shard
    #[arg(short, long)]
    dir: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the retained segment range
    Range,

    /// Scan every segment for corrupt frames and torn tails
    Verify,

    /// Print the entries of one segment
    Dump {
        /// Segment number (latest if omitted)
        #[arg(short, long)]
        segment: Option<u32>,

        /// Byte offset to start at
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Max entries to print
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct DumpedEntry {
    offset: u64,
    partition_hash: String,
    updated_at_ns: u64,
    ttl_second: u32,
    is_delete: bool,
    merge_type: String,
    key: String,
    value_len: usize,
    crc_ok: bool,
}

fn segment_range(dir: &Path) -> Result<SegmentRange> {
    let segments = list_segments(dir)?;
    let (Some(&earliest), Some(&latest)) = (segments.first(), segments.last()) else {
        bail!("no segments in {}", dir.display());
    };
    let latest_offset = std::fs::metadata(dir.join(segment_file_name(latest)))?.len();
    Ok(SegmentRange {
        earliest,
        latest,
        latest_offset,
    })
}

fn dump(dir: &Path, segment: Option<u32>, offset: u64, limit: usize, json: bool) -> Result<()> {
    let segment = match segment {
        Some(n) => n,
        None => segment_range(dir)?.latest,
    };
    let path = dir.join(segment_file_name(segment));
    let end = std::fs::metadata(&path)
        .with_context(|| format!("segment {} in {}", segment, dir.display()))?
        .len();

    let batch = read_entries(&path, offset, end, limit)?;
    let mut at = offset;
    for entry in &batch.entries {
        let dumped = DumpedEntry {
            offset: at,
            partition_hash: hex::encode(entry.partition_hash.to_be_bytes()),
            updated_at_ns: entry.updated_at_ns,
            ttl_second: entry.ttl_second,
            is_delete: entry.is_delete,
            merge_type: format!("{:?}", entry.merge_type()),
            key: hex::encode(&entry.key),
            value_len: entry.value.len(),
            crc_ok: entry.is_valid(),
        };
        at += entry.frame_len();
        if json {
            println!("{}", serde_json::to_string(&dumped)?);
        } else {
            println!(
                "{:>10} {} key={} {} ts={} ttl={} value={} crc={}",
                dumped.offset,
                dumped.partition_hash,
                dumped.key,
                if dumped.is_delete { "DEL".to_string() } else { dumped.merge_type.clone() },
                dumped.updated_at_ns,
                dumped.ttl_second,
                format_bytes(dumped.value_len as u64),
                if dumped.crc_ok { "ok" } else { "BAD" }
            );
        }
    }
    if !json {
        println!(
            "{} entries, {} skipped, next offset {}",
            batch.entries.len(),
            batch.skipped,
            batch.next_offset
        );
    }
    if let Some(reason) = batch.undelimited {
        return Err(ringkv::Error::CorruptEntry {
            segment,
            offset: batch.next_offset,
            reason,
        }
        .into());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Range => {
            let range = segment_range(&cli.dir)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&range)?);
            } else {
                println!("earliest segment: {}", range.earliest);
                println!("latest segment:   {}", range.latest);
                println!("latest offset:    {}", range.latest_offset);
            }
        }

        Commands::Verify => {
            let report = verify_log_dir(&cli.dir)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for s in &report.segments {
                    println!(
                        "segment {:>6}: {} entries, {} corrupt, {} torn bytes, {}",
                        s.segment,
                        s.entries,
                        s.corrupt,
                        s.torn_bytes,
                        format_bytes(s.bytes)
                    );
                }
                println!("{}", report);
            }
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }

        Commands::Dump {
            segment,
            offset,
            limit,
        } => dump(&cli.dir, segment, offset, limit, cli.json)?,
    }

    Ok(())
}
