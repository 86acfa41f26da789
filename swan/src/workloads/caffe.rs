// Copyright (c) Facebook, Inc. and its affiliates.
use super::*;

/// Large enough for inference to outlast any phase.
pub const ITERATIONS: u64 = 1_000_000_000;

lazy_static::lazy_static! {
    static ref PATH: Flag<String> = conf::string_flag(
        "caffe_path",
        "Path to the caffe wrapper script",
        "caffe.sh",
    );
    static ref MODEL: Flag<String> = conf::string_flag(
        "caffe_model",
        "Path to the trained model, relative to the caffe directory",
        "examples/cifar10/cifar10_quick_train_test.prototxt",
    );
    static ref WEIGHTS: Flag<String> = conf::string_flag(
        "caffe_weights",
        "Path to the trained weights, relative to the caffe directory",
        "examples/cifar10/cifar10_quick_iter_5000.caffemodel.h5",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&PATH);
    lazy_static::initialize(&MODEL);
    lazy_static::initialize(&WEIGHTS);
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaffeConfig {
    pub name: String,
    pub path: String,
    pub model: String,
    pub weights: String,
    pub iterations: u64,
}

impl CaffeConfig {
    pub fn from_flags() -> Self {
        Self {
            name: "Caffe".into(),
            path: PATH.value(),
            model: MODEL.value(),
            weights: WEIGHTS.value(),
            iterations: ITERATIONS,
        }
    }

    pub fn command(&self) -> String {
        format!(
            "{} test -model {} -weights {} -iterations {} -sigint_effect stop",
            &self.path, &self.model, &self.weights, self.iterations
        )
    }
}

/// Deep learning inference. Progress is reported as `Batch <n>` lines in
/// the output, see `parse::parse_caffe_batches()`.
pub struct Caffe {
    exec: ExecutorRef,
    cfg: CaffeConfig,
}

impl Caffe {
    pub fn new(exec: ExecutorRef, cfg: CaffeConfig) -> Self {
        Self { exec, cfg }
    }
}

impl Launcher for Caffe {
    fn name(&self) -> String {
        self.cfg.name.clone()
    }

    fn parameters(&self) -> String {
        self.cfg.command()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        self.exec.execute(&self.cfg.command())
    }
}
