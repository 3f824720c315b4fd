use crate::utils::Result;
use ndarray::{Array1, Array2};
use rand::Rng;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Version of the parameter file layout. Files with a different major
/// version are rejected.
pub const FORMAT_VERSION: &str = "1.0.0";

const DEFAULT_READ_LEN: usize = 40;
const DEFAULT_CHANNELS: usize = 3;
const DEFAULT_READ_HIDDEN: usize = 64;
const DEFAULT_INSTANCE_HIDDEN: usize = 128;
const DEFAULT_ATTENTION_HIDDEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub coverage: usize,
    pub read_len: usize,
    pub channels: usize,
    pub read_hidden: usize,
    pub instance_hidden: usize,
    pub attention_hidden: usize,
}

impl ModelConfig {
    pub fn for_coverage(coverage: usize) -> Self {
        ModelConfig {
            coverage,
            read_len: DEFAULT_READ_LEN,
            channels: DEFAULT_CHANNELS,
            read_hidden: DEFAULT_READ_HIDDEN,
            instance_hidden: DEFAULT_INSTANCE_HIDDEN,
            attention_hidden: DEFAULT_ATTENTION_HIDDEN,
        }
    }

    pub fn read_width(&self) -> usize {
        self.read_len * self.channels
    }

    /// Width of the per-locus feature: tumor, normal and their difference.
    pub fn locus_width(&self) -> usize {
        3 * self.read_hidden
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilParams {
    /// `[read_hidden, read_width]`
    pub read_weight: Array2<f32>,
    pub read_bias: Array1<f32>,
    /// `[instance_hidden, 3 * read_hidden]`
    pub instance_weight: Array2<f32>,
    pub instance_bias: Array1<f32>,
    pub norm_gamma: Array1<f32>,
    pub norm_beta: Array1<f32>,
    pub norm_running_mean: Array1<f32>,
    pub norm_running_var: Array1<f32>,
    /// `[attention_hidden, instance_hidden]`
    pub attention_v: Array2<f32>,
    pub attention_v_bias: Array1<f32>,
    pub attention_w: Array1<f32>,
    pub attention_w_bias: f32,
    pub classifier_weight: Array1<f32>,
    pub classifier_bias: f32,
}

impl MilParams {
    /// Xavier-uniform weights, zero biases and an identity batch norm.
    pub fn initialize<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        let read_weight = xavier(config.read_hidden, config.read_width(), rng);
        let instance_weight = xavier(config.instance_hidden, config.locus_width(), rng);
        let attention_v = xavier(config.attention_hidden, config.instance_hidden, rng);
        let attention_w = xavier(1, config.attention_hidden, rng).row(0).to_owned();
        let classifier_weight = xavier(1, config.instance_hidden, rng).row(0).to_owned();

        MilParams {
            read_weight,
            read_bias: Array1::zeros(config.read_hidden),
            instance_weight,
            instance_bias: Array1::zeros(config.instance_hidden),
            norm_gamma: Array1::ones(config.instance_hidden),
            norm_beta: Array1::zeros(config.instance_hidden),
            norm_running_mean: Array1::zeros(config.instance_hidden),
            norm_running_var: Array1::ones(config.instance_hidden),
            attention_v,
            attention_v_bias: Array1::zeros(config.attention_hidden),
            attention_w,
            attention_w_bias: 0.0,
            classifier_weight,
            classifier_bias: 0.0,
        }
    }

    pub fn check_shapes(&self, config: &ModelConfig) -> Result<()> {
        let matrices = [
            (
                "read_weight",
                self.read_weight.dim(),
                (config.read_hidden, config.read_width()),
            ),
            (
                "instance_weight",
                self.instance_weight.dim(),
                (config.instance_hidden, config.locus_width()),
            ),
            (
                "attention_v",
                self.attention_v.dim(),
                (config.attention_hidden, config.instance_hidden),
            ),
        ];
        for (name, found, expected) in matrices {
            if found != expected {
                return Err(format!(
                    "Parameter {} has shape {:?}, expected {:?}",
                    name, found, expected
                ));
            }
        }

        let vectors = [
            ("read_bias", self.read_bias.len(), config.read_hidden),
            ("instance_bias", self.instance_bias.len(), config.instance_hidden),
            ("norm_gamma", self.norm_gamma.len(), config.instance_hidden),
            ("norm_beta", self.norm_beta.len(), config.instance_hidden),
            (
                "norm_running_mean",
                self.norm_running_mean.len(),
                config.instance_hidden,
            ),
            (
                "norm_running_var",
                self.norm_running_var.len(),
                config.instance_hidden,
            ),
            (
                "attention_v_bias",
                self.attention_v_bias.len(),
                config.attention_hidden,
            ),
            ("attention_w", self.attention_w.len(), config.attention_hidden),
            (
                "classifier_weight",
                self.classifier_weight.len(),
                config.instance_hidden,
            ),
        ];
        for (name, found, expected) in vectors {
            if found != expected {
                return Err(format!(
                    "Parameter {} has length {}, expected {}",
                    name, found, expected
                ));
            }
        }

        if self.norm_running_var.iter().any(|v| *v < 0.0) {
            return Err("Parameter norm_running_var has negative entries".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ModelEnvelope {
    format_version: String,
    config: ModelConfig,
    params: MilParams,
}

pub fn save_parameters(path: &Path, config: &ModelConfig, params: &MilParams) -> Result<()> {
    let envelope = ModelEnvelope {
        format_version: FORMAT_VERSION.to_string(),
        config: config.clone(),
        params: params.clone(),
    };
    let file = File::create(path)
        .map_err(|e| format!("Failed to create model file {}: {}", path.display(), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &envelope)
        .map_err(|e| format!("Failed to serialize model {}: {}", path.display(), e))?;
    writer
        .flush()
        .map_err(|e| format!("Failed to write model file {}: {}", path.display(), e))
}

pub fn load_parameters(path: &Path) -> Result<(ModelConfig, MilParams)> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open model file {}: {}", path.display(), e))?;
    let envelope: ModelEnvelope = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| format!("Failed to parse model file {}: {}", path.display(), e))?;

    let found = Version::parse(&envelope.format_version).map_err(|e| {
        format!(
            "Invalid format version '{}' in {}: {}",
            envelope.format_version,
            path.display(),
            e
        )
    })?;
    let supported = Version::parse(FORMAT_VERSION).map_err(|e| e.to_string())?;
    if found.major != supported.major {
        return Err(format!(
            "Model file {} has format version {}, this build reads {}.x",
            path.display(),
            found,
            supported.major
        ));
    }

    envelope
        .params
        .check_shapes(&envelope.config)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    log::debug!("Loaded model {} ({:?})", path.display(), envelope.config);
    Ok((envelope.config, envelope.params))
}

fn xavier<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-limit..limit))
}
