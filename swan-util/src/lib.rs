// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use log::{info, warn};
use simplelog as sl;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, UNIX_EPOCH};

pub mod conf;
pub mod json_file;

pub use json_file::{JsonLoad, JsonReportFile, JsonSave};

lazy_static::lazy_static! {
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
    static ref LOG_SINKS: RwLock<Vec<Box<dyn sl::SharedLogger>>> = RwLock::new(vec![]);
    static ref LOG_MUX_INSTALLED: Mutex<bool> = Mutex::new(false);
}

pub fn nr_cpus() -> usize {
    *NR_SYSTEM_CPUS
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
            ('Y', 3600.0 * 24.0 * 365.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num.trim().parse::<f64>()? * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num.trim().parse::<f64>()?;
    }
    Ok(sum)
}

/// Parses the "1h2m3.5s" / "500ms" / "250us" notation used in flag
/// defaults and configuration dumps.
pub fn parse_go_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::from_secs(0));
    }
    if input.is_empty() {
        bail!("empty duration");
    }

    let mut secs = 0.0;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("missing unit in duration {:?}", input))?;
        if num_len == 0 {
            bail!("invalid duration {:?}", input);
        }
        let num = rest[..num_len]
            .parse::<f64>()
            .with_context(|| format!("invalid number in duration {:?}", input))?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let mult = match &rest[..unit_len] {
            "ns" => 0.000_000_001,
            "us" | "µs" => 0.000_001,
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => bail!("unknown unit {:?} in duration {:?}", unit, input),
        };
        secs += num * mult;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(secs).with_context(|| format!("duration {:?} out of range", input))
}

pub fn format_go_duration(dur: Duration) -> String {
    let nsecs = dur.as_nanos();
    if nsecs == 0 {
        return "0s".into();
    }
    if nsecs < 1_000 {
        return format!("{}ns", nsecs);
    }
    if nsecs < 1_000_000 {
        return format!("{}us", trim_float(nsecs as f64 / 1_000.0));
    }
    if nsecs < 1_000_000_000 {
        return format!("{}ms", trim_float(nsecs as f64 / 1_000_000.0));
    }

    let total = dur.as_secs_f64();
    let hours = (total / 3600.0).floor() as u64;
    let mins = ((total - hours as f64 * 3600.0) / 60.0).floor() as u64;
    let secs = total - hours as f64 * 3600.0 - mins as f64 * 60.0;

    let mut buf = String::new();
    if hours > 0 {
        buf += &format!("{}h", hours);
    }
    if hours > 0 || mins > 0 {
        buf += &format!("{}m", mins);
    }
    buf += &format!("{}s", trim_float(secs));
    buf
}

fn trim_float(v: f64) -> String {
    let s = format!("{:.9}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/// Duration flags accept both notations. Go style is tried first so that
/// "10m" keeps meaning ten minutes.
pub fn parse_flag_duration(input: &str) -> Result<Duration> {
    match parse_go_duration(input) {
        Ok(v) => Ok(v),
        Err(e) => match parse_duration(input) {
            Ok(secs) if secs >= 0.0 => Duration::try_from_secs_f64(secs)
                .with_context(|| format!("duration {:?} out of range", input)),
            _ => Err(e),
        },
    }
}

fn is_executable<P: AsRef<Path>>(path_in: P) -> bool {
    let path = path_in.as_ref();
    match path.metadata() {
        Ok(md) => md.is_file() && md.mode() & 0o111 != 0,
        Err(_) => false,
    }
}

pub fn find_bin<N: AsRef<OsStr>, P: AsRef<OsStr>>(
    name_in: N,
    prepend_in: Option<P>,
) -> Option<PathBuf> {
    let name = name_in.as_ref();
    let mut search = OsString::new();
    if let Some(prepend) = prepend_in.as_ref() {
        search.push(prepend);
        search.push(":");
    }
    if let Some(dirs) = env::var_os("PATH") {
        search.push(dirs);
    }
    for dir in env::split_paths(&search) {
        let mut path = dir.to_owned();
        path.push(name);
        if let Ok(path) = path.canonicalize() {
            if is_executable(&path) {
                return Some(path);
            }
        }
    }
    None
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

/// Returns up to `nr` trailing lines of the file.
pub fn read_last_lines<P: AsRef<Path>>(path: P, nr: usize) -> Result<Vec<String>> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let mut ring = VecDeque::with_capacity(nr + 1);
    for line in BufReader::new(f).lines() {
        ring.push_back(line?);
        if ring.len() > nr {
            ring.pop_front();
        }
    }
    Ok(ring.into_iter().collect())
}

/// Single-quotes `input` for `sh -c`.
pub fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r"'\''"))
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}

pub fn log_level_from(verbosity: u32, name: Option<&str>) -> Result<sl::LevelFilter> {
    if let Some(name) = name {
        return Ok(match name.to_lowercase().as_str() {
            "off" => sl::LevelFilter::Off,
            "error" => sl::LevelFilter::Error,
            "warn" | "warning" => sl::LevelFilter::Warn,
            "info" => sl::LevelFilter::Info,
            "debug" => sl::LevelFilter::Debug,
            "trace" => sl::LevelFilter::Trace,
            v => bail!("unknown log level {:?}", v),
        });
    }
    Ok(match verbosity {
        0 | 1 => sl::LevelFilter::Info,
        2 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    })
}

fn log_config() -> sl::Config {
    let mut lcfg = sl::ConfigBuilder::new();
    lcfg.set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off);
    lcfg.build()
}

struct LogMux {
    level: sl::LevelFilter,
}

impl log::Log for LogMux {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(sinks) = LOG_SINKS.read() {
            for sink in sinks.iter() {
                sink.log(record);
            }
        }
    }

    fn flush(&self) {
        if let Ok(sinks) = LOG_SINKS.read() {
            for sink in sinks.iter() {
                sink.flush();
            }
        }
    }
}

/// Installs the process logger. Output goes to stderr; more sinks can be
/// attached later with `add_log_file()`.
pub fn init_logging(level: sl::LevelFilter) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let term: Box<dyn sl::SharedLogger> = if console::user_attended_stderr() {
        sl::TermLogger::new(
            level,
            log_config(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        )
    } else {
        sl::WriteLogger::new(level, log_config(), std::io::stderr())
    };
    LOG_SINKS.write().unwrap().push(term);

    let mut installed = LOG_MUX_INSTALLED.lock().unwrap();
    if !*installed {
        if log::set_boxed_logger(Box::new(LogMux { level })).is_ok() {
            log::set_max_level(level);
            *installed = true;
        }
    }
}

/// Duplicates all further log output into `path`.
pub fn add_log_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !*LOG_MUX_INSTALLED.lock().unwrap() {
        warn!("log: RUST_LOG logger active, not writing {:?}", path);
        return Ok(());
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {:?}", path))?;
    LOG_SINKS
        .write()
        .unwrap()
        .push(sl::WriteLogger::new(log::max_level(), log_config(), file));
    Ok(())
}

pub fn flush_logging() {
    log::logger().flush();
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);

    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{:?} ({:?}): {}", &cmd_str, &rc, emsg,),
        Err(e) => bail!("{:?} ({:?}): {}", &cmd_str, &e, emsg,),
    }
}

/// Runs `cmd` to completion and returns its trimmed stdout.
pub fn command_output(cmd: &mut Command) -> Result<String> {
    let cmd_str = format!("{:?}", &cmd);
    let output = cmd
        .output()
        .with_context(|| format!("failed to execute {}", &cmd_str))?;
    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            &cmd_str,
            &output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Sends `sig` to every process in the group. Returns false if the group
/// is already gone.
pub fn signal_process_group(pgid: u32, sig: libc::c_int) -> Result<bool> {
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), sig) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(err).with_context(|| format!("failed to signal process group {}", pgid)),
    }
}

struct GlobalProgState {
    exiting: bool,
}

lazy_static::lazy_static! {
    static ref PROG_STATE: Mutex<GlobalProgState> = Mutex::new(GlobalProgState {
        exiting: false,
    });
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() -> Result<()> {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, draining...");
        set_prog_exiting();
    })
    .context("setting termination handler")
}

pub fn set_prog_exiting() {
    PROG_STATE.lock().unwrap().exiting = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    PROG_STATE.lock().unwrap().exiting
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Sleeps up to `dur`, returning early if the program starts exiting.
pub fn wait_prog_state(dur: Duration) -> ProgState {
    let state = PROG_STATE.lock().unwrap();
    if state.exiting {
        return ProgState::Exiting;
    }
    let state = PROG_WAITQ.wait_timeout(state, dur).unwrap().0;
    if state.exiting {
        ProgState::Exiting
    } else {
        ProgState::Running
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0000039, "3.9u"),
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (2040.0, "34.0M"),
            (1.27, "1.27"),
            (1.37, "100m1.27"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert_eq!(pair.0, result);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
    }

    #[test]
    fn test_go_duration() {
        for pair in &[
            (Duration::from_secs(15), "15s"),
            (Duration::from_secs(90), "1m30s"),
            (Duration::from_millis(500), "500ms"),
            (Duration::from_secs(3600 + 2), "1h0m2s"),
            (Duration::from_secs(0), "0s"),
        ] {
            assert_eq!(super::parse_go_duration(pair.1).unwrap(), pair.0);
            assert_eq!(super::format_go_duration(pair.0), pair.1);
        }
        assert_eq!(
            super::parse_go_duration("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
        assert!(super::parse_go_duration("abc").is_err());
        assert!(super::parse_go_duration("10x").is_err());
    }

    #[test]
    fn test_flag_duration_falls_back() {
        assert_eq!(
            super::parse_flag_duration("10m").unwrap(),
            Duration::from_secs(600)
        );
        assert_eq!(
            super::parse_flag_duration("1M_30").unwrap(),
            Duration::from_secs(90)
        );
        assert!(super::parse_flag_duration("ten").is_err());
    }

    #[test]
    fn test_duration_out_of_range() {
        for input in &["1e400", "99999999999999999999h"] {
            assert!(super::parse_flag_duration(input).is_err(), "{}", input);
        }
        assert!(super::parse_go_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(super::shell_quote("echo hi"), "'echo hi'");
        assert_eq!(super::shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_read_last_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "line {}", i).unwrap();
        }
        drop(f);
        let lines = super::read_last_lines(&path, 3).unwrap();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_log_level_from() {
        assert_eq!(
            super::log_level_from(0, Some("debug")).unwrap(),
            log::LevelFilter::Debug
        );
        assert_eq!(
            super::log_level_from(3, None).unwrap(),
            log::LevelFilter::Trace
        );
        assert!(super::log_level_from(0, Some("loud")).is_err());
    }
}
