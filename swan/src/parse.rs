// Copyright (c) Facebook, Inc. and its affiliates.
//! Extraction of latency, throughput and tuning results from the stdout of
//! load generators and workloads.
use anyhow::Result;
use regex::Regex;
use scan_fmt::scan_fmt;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::SwanError;

pub const QPS: &str = "qps";
pub const ISSUED_REQUESTS: &str = "issued_requests";
pub const PERCENTILE_99TH: &str = "percentile/99th";

pub type Results = BTreeMap<String, f64>;

lazy_static::lazy_static! {
    static ref MUTILATE_QPS_RE: Regex =
        Regex::new(r"^Total QPS\s*=\s*([0-9.]+)\s*\(\s*(\d+)\s*/\s*([0-9.]+)s\s*\)").unwrap();
    static ref SPECJBB_REQUESTS_RE: Regex =
        Regex::new(r"[0-9]+s:[()0-9%.|?]+rIR:aIR:PR=+([0-9]+):([0-9]+):([0-9]+)").unwrap();
    static ref CAFFE_BATCH_RE: Regex = Regex::new(r"Batch ([0-9]+)").unwrap();
}

fn parse_err(what: &str, msg: String) -> anyhow::Error {
    SwanError::Parse(what.into(), msg).into()
}

/// Reads `path` and hands the content to `parse`.
pub fn parse_file<T, F>(path: &Path, parse: F) -> Result<T>
where
    F: FnOnce(&str) -> Result<T>,
{
    let text = fs::read_to_string(path)
        .map_err(|e| SwanError::Io(format!("reading {:?}: {}", path, &e)))?;
    parse(&text)
}

fn mutilate_label(label: &str) -> Option<String> {
    Some(match label {
        "avg" | "std" | "min" | "max" => label.to_string(),
        "qps" => QPS.to_string(),
        v if v.ends_with("th") || v.ends_with("st") || v.ends_with("nd") || v.ends_with("rd") => {
            format!("percentile/{}", v)
        }
        _ => return None,
    })
}

/// Parses the mutilate report: the `#type` header names the columns of
/// the `read` row and `Total QPS = <qps> (<n> / <secs>s)` gives the
/// achieved throughput.
pub fn parse_mutilate(text: &str) -> Result<Results> {
    let mut columns: Vec<String> = vec![];
    let mut results = Results::new();

    for line in text.lines() {
        if line.starts_with("#type") {
            columns = line
                .split_whitespace()
                .skip(1)
                .map(|label| {
                    mutilate_label(label)
                        .ok_or_else(|| parse_err("mutilate", format!("unknown column {:?}", label)))
                })
                .collect::<Result<Vec<String>>>()?;
        } else if line.starts_with("read") {
            let fields: Vec<&str> = line.split_whitespace().skip(1).collect();
            if fields.len() != columns.len() {
                return Err(parse_err(
                    "mutilate",
                    format!(
                        "expected {} latency fields but got {}",
                        columns.len(),
                        fields.len()
                    ),
                ));
            }
            for (key, field) in columns.iter().zip(fields.iter()) {
                let v = field.parse::<f64>().map_err(|_| {
                    parse_err("mutilate", format!("latency {:?} is not a number", field))
                })?;
                results.insert(key.clone(), v);
            }
        } else if let Some(caps) = MUTILATE_QPS_RE.captures(line) {
            let qps = caps[1]
                .parse::<f64>()
                .map_err(|_| parse_err("mutilate", format!("invalid QPS in {:?}", line)))?;
            results.insert(QPS.into(), qps);
        }
    }
    Ok(results)
}

/// Achieved QPS and 99th percentile latency of a mutilate run.
pub fn mutilate_qps_and_sli(results: &Results) -> Result<(i64, i64)> {
    let qps = results
        .get(QPS)
        .ok_or_else(|| parse_err("mutilate", "no \"Total QPS\" line".into()))?;
    let sli = results
        .get(PERCENTILE_99TH)
        .ok_or_else(|| parse_err("mutilate", "no 99th percentile in the read row".into()))?;
    Ok((*qps as i64, *sli as i64))
}

const TOTAL_PURCHASE_KEYS: [&str; 12] = [
    "Success",
    "Partial",
    "Failed",
    "SkipFail",
    "Probes",
    "Samples",
    "min",
    "percentile/50th",
    "percentile/90th",
    "percentile/95th",
    PERCENTILE_99TH,
    "max",
];

fn squash(line: &str) -> String {
    line.split_whitespace().collect()
}

/// Parses the SPECjbb controller output of a fixed injection rate run.
/// The `TotalPurchase,` row carries the latencies and the progress lines
/// `rIR:aIR:PR = a:b:c` the issued and processed requests.
pub fn parse_specjbb_load(text: &str) -> Result<Results> {
    let mut results = Results::new();
    for line in text.lines() {
        let line = squash(line);
        if let Some(caps) = SPECJBB_REQUESTS_RE.captures(&line) {
            let issued = caps[2].parse::<u64>();
            let processed = caps[3].parse::<u64>();
            match (issued, processed) {
                (Ok(issued), Ok(processed)) => {
                    results.insert(ISSUED_REQUESTS.into(), issued as f64);
                    results.insert(QPS.into(), processed as f64);
                }
                _ => return Err(parse_err("SPECjbb", format!("invalid request counts in {:?}", line))),
            }
        } else if let Some(rest) = line.strip_prefix("TotalPurchase,") {
            let fields: Vec<&str> = rest.split(',').filter(|f| !f.is_empty()).collect();
            if fields.len() < TOTAL_PURCHASE_KEYS.len() {
                return Err(parse_err(
                    "SPECjbb",
                    format!(
                        "expected {} TotalPurchase fields but got {}",
                        TOTAL_PURCHASE_KEYS.len(),
                        fields.len()
                    ),
                ));
            }
            for (key, field) in TOTAL_PURCHASE_KEYS.iter().zip(fields.iter()) {
                let v = field.parse::<u64>().map_err(|_| {
                    parse_err("SPECjbb", format!("TotalPurchase field {:?} is not a number", field))
                })?;
                results.insert(key.to_string(), v as f64);
            }
        }
    }
    if !results.contains_key(QPS) {
        return Err(parse_err(
            "SPECjbb",
            "cannot find processed requests value (PR) in controller output".into(),
        ));
    }
    Ok(results)
}

/// Path of the binary log announced by `<n>s: Binary log file is <path>`.
pub fn parse_specjbb_raw_file_name(text: &str) -> Result<String> {
    for line in text.lines() {
        let line = squash(line);
        if line.contains("Binarylogfileis") {
            return match scan_fmt!(&line, "{d}s:Binarylogfileis{}", u64, String) {
                Ok((_, path)) => Ok(path),
                Err(e) => Err(parse_err("SPECjbb", format!("{:?}: {}", &line, &e))),
            };
        }
    }
    Err(parse_err("SPECjbb", "raw file name not found".into()))
}

/// `critical-jOPS` from the `RUN RESULT:` line of the reporter.
pub fn parse_specjbb_critical_jops(text: &str) -> Result<i64> {
    for line in text.lines() {
        let line = squash(line);
        if line.contains("RUNRESULT:") && line.contains("critical-jOPS") {
            let last = line.rsplit(',').next().unwrap_or("");
            return scan_fmt!(last, "critical-jOPS={d}", i64)
                .map_err(|e| parse_err("SPECjbb", format!("{:?}: {}", last, &e)));
        }
    }
    Err(parse_err("SPECjbb", "run result not found".into()))
}

/// Highest `Batch <n>` reported by caffe inference.
pub fn parse_caffe_batches(text: &str) -> Result<u64> {
    CAFFE_BATCH_RE
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<u64>().ok())
        .max()
        .ok_or_else(|| parse_err("caffe", "no batch number in the log".into()))
}
