//! `lpdrx status`: show the most recent snapshot from the status log.
//!
//! Reads the last line of the JSONL log written by `lpdrx run` and prints a
//! one-shot table of throughput and loss counters.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::path::Path;

use crate::color;

pub fn run(log_path: &Path) -> Result<()> {
    let content = match std::fs::read_to_string(log_path) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("No status log found at {}.", log_path.display());
            eprintln!("Start the receiver first:  lpdrx run");
            return Ok(());
        }
    };

    let line = match content.lines().filter(|l| !l.is_empty()).last() {
        Some(l) => l,
        None => {
            eprintln!("Status log is empty; the receiver may just be starting.");
            return Ok(());
        }
    };

    let entry: Value = serde_json::from_str(line)?;
    for row in render(&entry) {
        println!("{}", row);
    }
    Ok(())
}

fn format_ts(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn format_uptime(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

fn render(entry: &Value) -> Vec<String> {
    let u = |key: &str| entry[key].as_u64().unwrap_or(0);
    let ts = u("ts") as i64;
    let started_at = u("started_at") as i64;
    let uptime = if started_at > 0 { format_uptime((ts - started_at).max(0) as u64) } else { "-".into() };

    let width = 72;
    let mut out = vec![
        color::bold(&"=".repeat(width)),
        color::bold_cyan(&format!("{:^width$}", format!(" LPDRX STATUS  {} ", format_ts(ts)))),
        color::bold(&"=".repeat(width)),
        color::dim(&format!(
            "  FEMs: {}   Bit depth: {}   Uptime: {}",
            entry["fem_port_map"].as_str().unwrap_or("?"),
            entry["bit_depth"].as_str().unwrap_or("?"),
            uptime
        )),
        String::new(),
    ];

    out.push(format!("  {:<22} {:>14.0}", "packets/s", entry["packets_per_sec"].as_f64().unwrap_or(0.0)));
    out.push(format!("  {:<22} {:>14.1}", "images/s", entry["images_per_sec"].as_f64().unwrap_or(0.0)));
    out.push(color::dim(&"-".repeat(width)));
    for key in ["packets_received", "frames_complete", "images_emitted"] {
        out.push(format!("  {:<22} {:>14}", key, u(key)));
    }
    out.push(color::dim(&"-".repeat(width)));
    for key in [
        "packets_lost",
        "packets_ignored",
        "packets_malformed",
        "packets_duplicate",
        "packets_unbuffered",
        "packets_overflowed",
        "frames_timed_out",
        "frames_evicted",
        "frames_failed",
    ] {
        let v = u(key);
        let shown = if v > 0 { color::yellow(&v.to_string()) } else { v.to_string() };
        out.push(format!("  {:<22} {}", key, color::lpad(&shown, 14)));
    }

    let per_fem: Vec<String> = (0..6)
        .filter_map(|i| {
            let lost = u(&format!("fem_packets_lost/{}", i));
            (lost > 0).then(|| format!("FEM {}: {}", i, lost))
        })
        .collect();
    if !per_fem.is_empty() {
        out.push(String::new());
        out.push(color::red(&format!("  lost by FEM  {}", per_fem.join("   "))));
    }
    out
}
