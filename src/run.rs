//! `lpdrx run`: live receive loop.
//!
//! Binds one UDP socket per FEM port, runs the assemble/reorder pipeline and
//! appends a status snapshot to a JSONL log every N seconds. Ctrl-C stops the
//! receivers, flushes in-flight frames as dropped and writes a final entry.
//! Use `lpdrx status` to query the log.

use anyhow::Result;
use lpd_frame::{spawn_receivers, FemPortMap, Pipeline};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::RxConfig;
use crate::sink::ImageWriter;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Serialize)]
struct LogEntry<'a> {
    ts: u64,
    started_at: u64,
    packets_per_sec: f64,
    images_per_sec: f64,
    #[serde(flatten)]
    status: &'a Map<String, Value>,
}

pub fn run(config: &RxConfig, interval_secs: Option<u64>, log_path: Option<PathBuf>) -> Result<()> {
    let settings = config.pipeline.settings.clone();
    let ports = FemPortMap::parse(&settings.fem_port_map)?.ports();
    let interval = Duration::from_secs(interval_secs.unwrap_or(config.output.status_interval_secs).max(1));
    let log_path = log_path.unwrap_or_else(|| config.output.status_log.clone().into());

    let sink = ImageWriter::create(config.output.image_dir.as_deref().map(Path::new))?;
    let mut pipeline = Pipeline::start(settings, config.pipeline.options(), sink)?;

    let running = Arc::new(AtomicBool::new(true));
    let receivers = spawn_receivers(
        config.receiver.bind_addr,
        &ports,
        config.recv_buffer_bytes(),
        config.receiver.pin_recv_core,
        pipeline.packet_sender(),
        pipeline.loss().clone(),
        running.clone(),
    )?;

    eprintln!(
        "lpdrx run: {} FEM port(s) {:?}, logging to {} every {}s (Ctrl-C to stop)",
        ports.len(),
        ports,
        log_path.display(),
        interval.as_secs()
    );

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    let started_at = unix_now();
    let mut prev = pipeline.status();
    let mut prev_time = Instant::now();

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if prev_time.elapsed() < interval {
            continue;
        }
        let now = Instant::now();
        let curr = pipeline.status();
        append_entry(&log_path, started_at, &curr, &prev, now.duration_since(prev_time).as_secs_f64());
        prev = curr;
        prev_time = now;
    }

    tracing::info!("stopping");
    running.store(false, Ordering::SeqCst);
    for handle in receivers {
        let _ = handle.join();
    }
    pipeline.stop();

    let curr = pipeline.status();
    append_entry(&log_path, started_at, &curr, &prev, prev_time.elapsed().as_secs_f64());
    println!("{}", serde_json::to_string_pretty(&curr)?);
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn counter(status: &Map<String, Value>, key: &str) -> u64 {
    status.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn append_entry(
    log_path: &Path,
    started_at: u64,
    curr: &Map<String, Value>,
    prev: &Map<String, Value>,
    elapsed: f64,
) {
    let rate = |key: &str| {
        if elapsed > 0.0 {
            counter(curr, key).saturating_sub(counter(prev, key)) as f64 / elapsed
        } else {
            0.0
        }
    };
    let entry = LogEntry {
        ts: unix_now(),
        started_at,
        packets_per_sec: rate("packets_received"),
        images_per_sec: rate("images_emitted"),
        status: curr,
    };

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{}", line);
        }
    } else {
        tracing::warn!(path = %log_path.display(), "cannot open status log");
    }
}
