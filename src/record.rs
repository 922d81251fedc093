//! Execution records and their normalization into caller-facing results.
//!
//! A record is either assembled from a host process handle or decoded from
//! the JSON document the `record` wrapper prints after the submission
//! finishes. [`normalize`] turns it into an [`ExecutionResult`] and cannot
//! fail.

use std::time::Duration;

use nix::libc;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, PartialOutput};

/// Line the wrapper prints right before its JSON record, so the record can be
/// told apart from anything else on the same stream.
pub const RECORD_MARKER: &str = "##PLAYGROUND-RECORD##";

/// Environment variable carrying the wrapper's per-stream output ceiling.
pub const OUTPUT_LIMIT_ENV: &str = "RECORD_MAX_OUTPUT_BYTES";

/// Room for the marker line, the counters and the JSON punctuation.
const RECORD_OVERHEAD: usize = 64 * 1024;

/// Largest rendered record for a wrapper whose per-stream ceiling is
/// `max_output_bytes`. JSON escapes a control byte as `\u00XX`, six bytes,
/// and both streams share the record.
pub const fn wrapper_output_ceiling(max_output_bytes: usize) -> usize {
    max_output_bytes
        .saturating_mul(2 * 6)
        .saturating_add(RECORD_OVERHEAD)
}

/// How the submission's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

impl Termination {
    /// Decode a raw wait status as produced by `waitpid(2)`.
    pub fn from_wait_status(raw: i64) -> Self {
        let Ok(status) = i32::try_from(raw) else {
            return Self::Unknown;
        };
        match WaitStatus::from_raw(Pid::from_raw(0), status) {
            Ok(WaitStatus::Exited(_, code)) => Self::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Self::Signaled(signal as i32),
            // Realtime signals have no `Signal` variant
            Err(_) if libc::WIFSIGNALED(status) => Self::Signaled(libc::WTERMSIG(status)),
            _ => Self::Unknown,
        }
    }

    /// Numeric exit code, with the shell convention `128 + signal` for
    /// signalled processes and -1 when unknown.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
            Self::Unknown => -1,
        }
    }
}

/// Resource usage counters in the units `getrusage(2)` reports them in.
/// Counters a backend cannot supply stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceUsage {
    /// User CPU time in microseconds.
    pub utime: i64,
    /// System CPU time in microseconds.
    pub stime: i64,
    /// Peak resident set size in kilobytes.
    pub maxrss: i64,
    pub minflt: i64,
    pub majflt: i64,
    pub inblock: i64,
    pub oublock: i64,
    pub nvcsw: i64,
    pub nivcsw: i64,
}

/// Raw outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub wall_time: Duration,
    pub usage: ResourceUsage,
    /// Output was already cut while it was being captured.
    pub truncated: bool,
}

/// JSON document printed by the `record` wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapperRecord {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Raw wait status of the submission.
    pub status: i64,
    /// Wall time in nanoseconds.
    pub rtime: i64,
    #[serde(default)]
    pub rusage: ResourceUsage,
    /// The wrapper cut the submission's output at its ceiling.
    #[serde(default)]
    pub truncated: bool,
}

impl WrapperRecord {
    /// Render the record the way the wrapper prints it.
    pub fn render(&self) -> serde_json::Result<String> {
        Ok(format!("{RECORD_MARKER}\n{}\n", serde_json::to_string(self)?))
    }
}

/// Decode the wrapper's output stream into a record.
///
/// The JSON after the last marker line is used; without one the whole
/// stream must be the JSON object. The marker only counts when followed by
/// a raw newline, which never occurs inside an encoded JSON string, so a
/// submission printing the marker cannot shift the split. `side_channel` is
/// whatever else the environment printed (e.g. container stderr) and is
/// only kept for the best-effort output of a parse failure.
pub fn parse_wrapper_output(
    output: &[u8],
    side_channel: &[u8],
) -> Result<ExecutionRecord, ExecutionError> {
    let marker = format!("{RECORD_MARKER}\n");
    let marker = marker.as_bytes();
    let payload = output
        .windows(marker.len())
        .rposition(|window| window == marker)
        .map_or(output, |idx| &output[idx + marker.len()..]);

    let parse_error = |message: String| ExecutionError::RecordParse {
        message,
        partial: PartialOutput::new(output, side_channel),
    };

    let record: WrapperRecord =
        serde_json::from_slice(payload).map_err(|e| parse_error(e.to_string()))?;

    if record.rtime < 0 {
        return Err(parse_error(format!("negative rtime {}", record.rtime)));
    }

    Ok(ExecutionRecord {
        termination: Termination::from_wait_status(record.status),
        stdout: record.stdout.into_bytes(),
        stderr: record.stderr.into_bytes(),
        wall_time: Duration::from_nanos(record.rtime.unsigned_abs()),
        usage: record.rusage,
        truncated: record.truncated,
    })
}

/// Normalized result returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `ok`, a program outcome (`nonzero_exit`, `signaled`,
    /// `unknown_termination`) or a service failure tag.
    pub status: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall time in nanoseconds.
    pub real_time: u64,
    /// User CPU time in nanoseconds.
    pub user_time: u64,
    /// System CPU time in nanoseconds.
    pub system_time: u64,
    /// Peak resident set size in kilobytes.
    pub max_rss: u64,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Terminal result for a failed stage. Output captured before the
    /// failure is kept, everything numeric is zero.
    pub fn failure(error: &ExecutionError, max_output_bytes: usize) -> Self {
        let empty = PartialOutput::default();
        let partial = error.partial_output().unwrap_or(&empty);
        Self::from_status(error.status(), &partial.stdout, &partial.stderr, max_output_bytes)
    }

    /// Terminal result for a status with no program output at all.
    pub fn rejected(status: &str) -> Self {
        Self::from_status(status, &[], &[], 0)
    }

    fn from_status(status: &str, stdout: &[u8], stderr: &[u8], max_output_bytes: usize) -> Self {
        let (stdout, cut_out) = truncate_output(stdout, max_output_bytes);
        let (stderr, cut_err) = truncate_output(stderr, max_output_bytes);
        Self {
            status: status.to_string(),
            exit_code: -1,
            stdout,
            stderr,
            real_time: 0,
            user_time: 0,
            system_time: 0,
            max_rss: 0,
            truncated: cut_out || cut_err,
        }
    }
}

/// Turn a raw record into the caller-facing result.
pub fn normalize(record: &ExecutionRecord, max_output_bytes: usize) -> ExecutionResult {
    let status = match record.termination {
        Termination::Exited(0) => "ok",
        Termination::Exited(_) => "nonzero_exit",
        Termination::Signaled(_) => "signaled",
        Termination::Unknown => "unknown_termination",
    };
    let (stdout, cut_out) = truncate_output(&record.stdout, max_output_bytes);
    let (stderr, cut_err) = truncate_output(&record.stderr, max_output_bytes);

    ExecutionResult {
        status: status.to_string(),
        exit_code: record.termination.exit_code(),
        stdout,
        stderr,
        real_time: u64::try_from(record.wall_time.as_nanos()).unwrap_or(u64::MAX),
        user_time: micros_to_nanos(record.usage.utime),
        system_time: micros_to_nanos(record.usage.stime),
        max_rss: clamp(record.usage.maxrss),
        truncated: record.truncated || cut_out || cut_err,
    }
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn micros_to_nanos(micros: i64) -> u64 {
    clamp(micros).saturating_mul(1_000)
}

/// Decode lossily and cut to at most `limit` bytes on a char boundary.
fn truncate_output(bytes: &[u8], limit: usize) -> (String, bool) {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= limit {
        return (text, false);
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}
