//! record
//!
//! Instrumented wrapper that runs inside a sandbox. It runs one command,
//! captures its output, and prints a structured execution record (wait
//! status, wall time, resource usage) on stdout after a marker line.
//! The wrapper has exactly one child, so `RUSAGE_CHILDREN` covers the
//! command and whatever descendants it waited for.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::resource::{getrusage, Usage, UsageWho};
use nix::sys::time::TimeVal;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use playground_executor::capture::Capture;
use playground_executor::record::{ResourceUsage, WrapperRecord, OUTPUT_LIMIT_ENV};

const DEFAULT_LIMIT: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "record")]
#[command(about = "Run a command and print its execution record as JSON")]
struct Args {
    /// Command and arguments to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let limit = std::env::var(OUTPUT_LIMIT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_LIMIT);

    let started = Instant::now();
    let mut child = Command::new(&args.command[0])
        .args(&args.command[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", args.command[0]))?;

    let child_stdout = child.stdout.take().context("Failed to open stdout")?;
    let child_stderr = child.stderr.take().context("Failed to open stderr")?;

    let mut stdout = Capture::new(limit);
    let mut stderr = Capture::new(limit);
    let (r1, r2) = tokio::join!(stdout.drain(child_stdout), stderr.drain(child_stderr));
    r1.context("Failed to read stdout")?;
    r2.context("Failed to read stderr")?;

    let status = child.wait().await.context("Failed to wait for process")?;
    let rtime = started.elapsed();
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).context("getrusage failed")?;

    let record = WrapperRecord {
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        status: i64::from(status.into_raw()),
        rtime: i64::try_from(rtime.as_nanos()).unwrap_or(i64::MAX),
        rusage: resource_usage(&usage),
        truncated: stdout.truncated || stderr.truncated,
    };

    let rendered = record.render().context("Failed to encode record")?;
    let mut out = tokio::io::stdout();
    out.write_all(rendered.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

fn micros(tv: TimeVal) -> i64 {
    i64::from(tv.tv_sec())
        .saturating_mul(1_000_000)
        .saturating_add(i64::from(tv.tv_usec()))
}

fn resource_usage(usage: &Usage) -> ResourceUsage {
    ResourceUsage {
        utime: micros(usage.user_time()),
        stime: micros(usage.system_time()),
        maxrss: i64::from(usage.max_rss()),
        minflt: i64::from(usage.minor_page_faults()),
        majflt: i64::from(usage.major_page_faults()),
        inblock: i64::from(usage.block_reads()),
        oublock: i64::from(usage.block_writes()),
        nvcsw: i64::from(usage.voluntary_context_switches()),
        nivcsw: i64::from(usage.involuntary_context_switches()),
    }
}
