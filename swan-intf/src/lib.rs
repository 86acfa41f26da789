// Copyright (c) Facebook, Inc. and its affiliates.
use std::fmt;

pub mod record;

pub use record::{ExperimentRecord, MeasurementRecord, MetadataEntry, MetadataKind, PhaseRecord};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}

/// BSD sysexits codes used as process exit status.
pub const EX_OK: i32 = 0;
pub const EX_USAGE: i32 = 64;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_IOERR: i32 = 74;

pub const BASELINE_LABEL: &str = "Baseline";
pub const BASELINE_PHASE: &str = "baseline";
pub const AGGRESSOR_JOIN: &str = "And";

pub const TAG_EXPERIMENT_ID: &str = "experiment_id";
pub const TAG_PHASE_ID: &str = "phase_id";
pub const TAG_REPETITION_ID: &str = "repetition_id";
pub const TAG_LOAD_POINT_QPS: &str = "load_point_qps";
pub const TAG_AGGRESSOR_NAME: &str = "aggressor_name";

/// `Baseline` for no aggressors, otherwise the names joined with `And`.
/// An aggressor literally named `And` is not escaped.
pub fn aggressor_label<S: AsRef<str>>(names: &[S]) -> String {
    if names.is_empty() {
        BASELINE_LABEL.to_string()
    } else {
        names
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<&str>>()
            .join(AGGRESSOR_JOIN)
    }
}

/// `baseline` or `aggressor_nr_<k>` where `k` is the zero-based position
/// of the aggressor in the phase list.
pub fn phase_name(aggressor_idx: Option<usize>) -> String {
    match aggressor_idx {
        None => BASELINE_PHASE.to_string(),
        Some(k) => format!("aggressor_nr_{}", k),
    }
}

/// Tag set attached to every telemetry session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionTags {
    pub experiment_id: String,
    pub phase_id: String,
    pub repetition_id: u32,
    pub load_point_qps: i64,
    pub aggressor_name: String,
}

impl fmt::Display for SessionTags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        write!(
            f,
            "{}:{},{}:{},{}:{},{}:{},{}:{}",
            TAG_EXPERIMENT_ID,
            strip(&self.experiment_id),
            TAG_PHASE_ID,
            strip(&self.phase_id),
            TAG_REPETITION_ID,
            self.repetition_id,
            TAG_LOAD_POINT_QPS,
            self.load_point_qps,
            TAG_AGGRESSOR_NAME,
            strip(&self.aggressor_name),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggressor_label() {
        let none: [&str; 0] = [];
        assert_eq!(aggressor_label(&none), "Baseline");
        assert_eq!(aggressor_label(&["l1d"]), "l1d");
        assert_eq!(aggressor_label(&["l1d", "membw"]), "l1dAndmembw");
        assert_eq!(aggressor_label(&["And", "x"]), "AndAndx");
    }

    #[test]
    fn test_phase_name() {
        assert_eq!(phase_name(None), "baseline");
        assert_eq!(phase_name(Some(0)), "aggressor_nr_0");
        assert_eq!(phase_name(Some(3)), "aggressor_nr_3");
    }

    #[test]
    fn test_session_tags() {
        let tags = SessionTags {
            experiment_id: "abc".into(),
            phase_id: "aggressor_nr_0".into(),
            repetition_id: 1,
            load_point_qps: 2000,
            aggressor_name: "Caffe isolated".into(),
        };
        assert_eq!(
            tags.to_string(),
            "experiment_id:abc,phase_id:aggressor_nr_0,repetition_id:1,\
             load_point_qps:2000,aggressor_name:Caffeisolated"
        );
    }
}
