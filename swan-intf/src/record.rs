// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use swan_util::*;

const EXPERIMENT_DOC: &str = "\
//
// swan experiment record
//
//  id: Experiment UUID
//  load_duration: Length of each load run in seconds
//  tuning_duration: Length of the tuning run in seconds
//  lc_name: Latency critical workload
//  lg_names[]: Load generators driving the LC workload
//  repetitions: Repetitions per load point
//  load_points: Number of load points
//  slo: Target 99th percentile latency in microseconds
//  phases[].id: baseline or aggressor_nr_<k>
//  phases[].aggressor_names[]: Aggressors co-located in the phase
//  phases[].measurements[]: One entry per load point and repetition, by load
//
";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub experiment_id: String,
    pub phase_id: String,
    pub load: i64,
    pub load_point_qps: i64,
    #[serde(default)]
    pub repetition: u32,
    #[serde(default)]
    pub lg_parameters: Vec<String>,
    /// Parsed load generator output, e.g. `percentile/99th` and `qps`.
    #[serde(default)]
    pub results: BTreeMap<String, f64>,
}

impl MeasurementRecord {
    pub fn key(&self) -> (String, String, i64, u32) {
        (
            self.experiment_id.clone(),
            self.phase_id.clone(),
            self.load,
            self.repetition,
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub experiment_id: String,
    pub id: String,
    pub lc_parameters: String,
    pub lc_isolation: String,
    pub aggressor_names: Vec<String>,
    pub aggressor_parameters: Vec<String>,
    pub aggressor_isolations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<MeasurementRecord>,
}

impl PhaseRecord {
    pub fn add_measurement(&mut self, measurement: MeasurementRecord) {
        self.measurements.push(measurement);
    }

    pub fn sort_measurements(&mut self) {
        self.measurements
            .sort_by(|a, b| (a.load, a.repetition).cmp(&(b.load, b.repetition)));
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub load_duration: f64,
    pub tuning_duration: f64,
    pub lc_name: String,
    pub lg_names: Vec<String>,
    pub repetitions: u32,
    pub load_points: u32,
    pub slo: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseRecord>,
}

impl ExperimentRecord {
    pub fn add_phase(&mut self, phase: PhaseRecord) {
        self.phases.push(phase);
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    /// The record without nested phases, as stored in the experiment table.
    pub fn row(&self) -> Self {
        Self {
            phases: vec![],
            ..self.clone()
        }
    }
}

impl JsonLoad for ExperimentRecord {}

impl JsonSave for ExperimentRecord {
    fn preamble() -> Option<String> {
        Some(EXPERIMENT_DOC.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetadataKind {
    #[serde(rename = "")]
    Generic,
    #[serde(rename = "flags")]
    Flags,
    #[serde(rename = "environ")]
    Environ,
    #[serde(rename = "platform")]
    Platform,
}

impl Default for MetadataKind {
    fn default() -> Self {
        Self::Generic
    }
}

impl MetadataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "",
            Self::Flags => "flags",
            Self::Environ => "environ",
            Self::Platform => "platform",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        Ok(match input {
            "" => Self::Generic,
            "flags" => Self::Flags,
            "environ" => Self::Environ,
            "platform" => Self::Platform,
            v => bail!("unknown metadata kind {:?}", v),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub experiment_id: String,
    pub kind: MetadataKind,
    /// Seconds since epoch.
    pub time: u64,
    pub time_uuid: Uuid,
    pub map: BTreeMap<String, String>,
}

impl MetadataEntry {
    pub fn new(experiment_id: &str, kind: MetadataKind, map: BTreeMap<String, String>) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            kind,
            time: unix_now(),
            time_uuid: Uuid::now_v7(),
            map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_measurements() {
        let mut phase = PhaseRecord::default();
        for (load, rep) in &[(4000, 1), (2000, 0), (4000, 0), (2000, 1)] {
            phase.add_measurement(MeasurementRecord {
                load: *load,
                load_point_qps: *load,
                repetition: *rep,
                ..Default::default()
            });
        }
        phase.sort_measurements();
        let order: Vec<(i64, u32)> = phase
            .measurements
            .iter()
            .map(|m| (m.load, m.repetition))
            .collect();
        assert_eq!(order, vec![(2000, 0), (2000, 1), (4000, 0), (4000, 1)]);
    }

    #[test]
    fn test_metadata_kind() {
        for kind in &[
            MetadataKind::Generic,
            MetadataKind::Flags,
            MetadataKind::Environ,
            MetadataKind::Platform,
        ] {
            assert_eq!(MetadataKind::parse(kind.as_str()).unwrap(), *kind);
            assert_eq!(
                serde_json::to_string(kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert!(MetadataKind::parse("bogus").is_err());
    }

    #[test]
    fn test_experiment_row_strips_phases() {
        let mut exp = ExperimentRecord {
            id: "x".into(),
            ..Default::default()
        };
        exp.add_phase(PhaseRecord {
            id: "baseline".into(),
            ..Default::default()
        });
        assert!(exp.phase_mut("baseline").is_some());
        assert!(exp.row().phases.is_empty());
        let json = exp.row().as_json().unwrap();
        assert!(json.starts_with("//"));
        assert!(!json.contains("phases"));
    }
}
