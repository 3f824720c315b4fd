use super::params::{load_parameters, MilParams, ModelConfig};
use crate::mimsi::bags::{Bag, Instance, UNKNOWN_LABEL};
use crate::utils::{Device, Result};
use ndarray::{concatenate, Array1, Array2, Axis};
use rand::Rng;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::path::Path;

const NORM_EPS: f32 = 1e-5;
const PROB_EPS: f32 = 1e-5;
const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Outcome of classifying one bag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Binary cross-entropy against the nominal label; `None` when the label
    /// is the unknown sentinel.
    pub loss: Option<f64>,
    pub probability: f64,
    pub decision: bool,
}

pub trait BagClassifier {
    /// Freezes the classifier for evaluation: no parameter or statistics
    /// updates happen afterwards.
    fn set_inference_mode(&mut self);

    fn device(&self) -> Device;

    fn evaluate(&self, bag: &Bag, label: i64) -> Result<Evaluation>;
}

/// Attention-pooled multiple-instance classifier over microsatellite loci.
pub struct MilModel {
    config: ModelConfig,
    params: MilParams,
    device: Device,
    mode: Mode,
    pool: Option<ThreadPool>,
}

impl MilModel {
    pub fn new<R: Rng + ?Sized>(config: ModelConfig, device: Device, rng: &mut R) -> Result<Self> {
        let pool = match device {
            Device::Cpu => None,
            Device::Accelerated { threads } => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("mimsi-{}", i))
                    .build()
                    .map_err(|e| format!("Failed to initialize thread pool: {}", e))?,
            ),
        };
        let params = MilParams::initialize(&config, rng);
        Ok(MilModel {
            config,
            params,
            device,
            mode: Mode::Training,
            pool,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn params(&self) -> &MilParams {
        &self.params
    }

    /// Replaces the current parameters with the ones stored at `path`. The
    /// stored configuration must match the one this model was built with.
    pub fn load_parameters(&mut self, path: &Path) -> Result<()> {
        let (config, params) = load_parameters(path)?;
        if config.coverage != self.config.coverage {
            return Err(format!(
                "Model {} was trained with coverage {}, but coverage {} was requested",
                path.display(),
                config.coverage,
                self.config.coverage
            ));
        }
        if config != self.config {
            return Err(format!(
                "Model {} architecture {:?} does not match expected {:?}",
                path.display(),
                config,
                self.config
            ));
        }
        self.params = params;
        Ok(())
    }

    fn check_bag(&self, bag: &Bag) -> Result<()> {
        if bag.device() != self.device {
            return Err(format!(
                "Device mismatch: bag is on {}, model is on {}",
                bag.device(),
                self.device
            ));
        }
        if bag.is_empty() {
            return Err("Bag contains no loci".to_string());
        }
        if bag.read_width() != self.config.read_width() {
            return Err(format!(
                "Read vectors have width {}, model expects {} ({} x {})",
                bag.read_width(),
                self.config.read_width(),
                self.config.read_len,
                self.config.channels
            ));
        }
        Ok(())
    }

    /// Depth-weighted pooling: read embeddings are summed and divided by
    /// the coverage cap, so loci below the cap contribute proportionally less.
    fn pool_reads(&self, bag: &Bag, rows: &[usize]) -> Array1<f32> {
        let p = &self.params;
        if rows.is_empty() {
            return Array1::zeros(self.config.read_hidden);
        }
        let reads = bag.data().select_reads(rows);
        let mut hidden = reads.dot(&p.read_weight.t());
        hidden += &p.read_bias;
        hidden.mapv_inplace(relu);
        hidden.sum_axis(Axis(0)) / self.config.coverage as f32
    }

    fn encode_instance(&self, bag: &Bag, instance: &Instance) -> Result<Array1<f32>> {
        let tumor = self.pool_reads(bag, &instance.tumor);
        let normal = self.pool_reads(bag, &instance.normal);
        let diff = &tumor - &normal;
        let features = concatenate(Axis(0), &[tumor.view(), normal.view(), diff.view()])
            .map_err(|e| e.to_string())?;
        Ok(self.params.instance_weight.dot(&features) + &self.params.instance_bias)
    }

    fn encode_instances(&self, bag: &Bag) -> Result<Array2<f32>> {
        let rows = match &self.pool {
            Some(pool) => pool.install(|| {
                bag.instances()
                    .par_iter()
                    .map(|instance| self.encode_instance(bag, instance))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => bag
                .instances()
                .iter()
                .map(|instance| self.encode_instance(bag, instance))
                .collect::<Result<Vec<_>>>()?,
        };

        let mut encoded = Array2::zeros((rows.len(), self.config.instance_hidden));
        for (mut target, row) in encoded.outer_iter_mut().zip(rows) {
            target.assign(&row);
        }
        Ok(encoded)
    }

    fn batch_norm(&self, encoded: &mut Array2<f32>) {
        let p = &self.params;
        let (mean, var) = match self.mode {
            Mode::Inference => (p.norm_running_mean.clone(), p.norm_running_var.clone()),
            Mode::Training => {
                let mean = encoded
                    .mean_axis(Axis(0))
                    .unwrap_or_else(|| Array1::zeros(encoded.ncols()));
                let var = encoded.var_axis(Axis(0), 0.0);
                (mean, var)
            }
        };
        let scale = &p.norm_gamma / &var.mapv(|v| (v + NORM_EPS).sqrt());
        *encoded -= &mean;
        *encoded *= &scale;
        *encoded += &p.norm_beta;
    }

    fn forward(&self, bag: &Bag) -> Result<f32> {
        let p = &self.params;
        let mut h = self.encode_instances(bag)?;
        self.batch_norm(&mut h);
        h.mapv_inplace(relu);

        let mut gate = h.dot(&p.attention_v.t());
        gate += &p.attention_v_bias;
        gate.mapv_inplace(f32::tanh);
        let scores = gate.dot(&p.attention_w) + p.attention_w_bias;
        let attention = softmax(&scores);

        let pooled = attention.dot(&h);
        let logit = pooled.dot(&p.classifier_weight) + p.classifier_bias;
        Ok(sigmoid(logit).clamp(PROB_EPS, 1.0 - PROB_EPS))
    }
}

impl BagClassifier for MilModel {
    fn set_inference_mode(&mut self) {
        self.mode = Mode::Inference;
    }

    fn device(&self) -> Device {
        self.device
    }

    fn evaluate(&self, bag: &Bag, label: i64) -> Result<Evaluation> {
        self.check_bag(bag)?;
        let loss_target = match label {
            0 | 1 => Some(label as f64),
            UNKNOWN_LABEL => None,
            other => return Err(format!("Invalid bag label {}", other)),
        };

        let probability = self.forward(bag)?;
        if !probability.is_finite() {
            return Err(format!("Classifier produced a non-finite probability ({})", probability));
        }
        let probability = probability as f64;
        let loss = loss_target
            .map(|y| -(y * probability.ln() + (1.0 - y) * (1.0 - probability).ln()));

        Ok(Evaluation {
            loss,
            probability,
            decision: probability >= DECISION_THRESHOLD,
        })
    }
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(scores: &Array1<f32>) -> Array1<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = scores.mapv(|s| (s - max).exp());
    let total = exp.sum();
    exp / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mimsi::bags::{BagConfig, BagSource, SampleBags};
    use crate::mimsi::fixtures::{random_model, random_params, small_config, write_sample};
    use crate::mimsi::model::save_parameters;
    use rand::{rngs::StdRng, SeedableRng};

    fn load_sample(counts: &[(usize, usize)], coverage: usize, repeats: usize) -> SampleBags {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "S1", -1, counts, 4);
        let config = BagConfig {
            repeat_count: repeats,
            coverage,
            ..BagConfig::default()
        };
        let mut source = BagSource::new(dir.path(), config, StdRng::seed_from_u64(2)).unwrap();
        source.next().unwrap().unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let weights = softmax(&Array1::from(vec![1.0, 2.0, 1000.0]));
        assert!((weights.sum() - 1.0).abs() < 1e-6);
        assert!(weights[2] > 0.99);
    }

    #[test]
    fn test_probabilities_in_unit_interval() {
        let mut model = random_model(10, Device::Cpu, 1);
        model.set_inference_mode();
        let sample = load_sample(&[(30, 25), (4, 12), (0, 8)], 10, 20);
        for bag in &sample.bags {
            let evaluation = model.evaluate(bag, UNKNOWN_LABEL).unwrap();
            assert!((0.0..=1.0).contains(&evaluation.probability));
            assert_eq!(evaluation.decision, evaluation.probability >= 0.5);
            assert_eq!(evaluation.loss, None);
        }
    }

    #[test]
    fn test_loss_for_known_labels() {
        let mut model = random_model(10, Device::Cpu, 1);
        model.set_inference_mode();
        let sample = load_sample(&[(30, 25), (4, 12)], 10, 1);
        let positive = model.evaluate(&sample.bags[0], 1).unwrap();
        let negative = model.evaluate(&sample.bags[0], 0).unwrap();
        let p = positive.probability;
        assert!((positive.loss.unwrap() + p.ln()).abs() < 1e-9);
        assert!((negative.loss.unwrap() + (1.0 - p).ln()).abs() < 1e-9);
        assert!(model.evaluate(&sample.bags[0], 2).is_err());
    }

    #[test]
    fn test_device_mismatch() {
        let model = random_model(10, Device::Cpu, 1);
        let sample = load_sample(&[(3, 3)], 10, 1);
        let bag = sample.bags[0].clone().to_device(Device::Accelerated { threads: 2 });
        let err = model.evaluate(&bag, UNKNOWN_LABEL).unwrap_err();
        assert!(err.starts_with("Device mismatch"));
    }

    #[test]
    fn test_accelerated_matches_cpu() {
        let mut cpu = random_model(10, Device::Cpu, 3);
        let device = Device::Accelerated { threads: 2 };
        let mut accelerated = random_model(10, device, 3);
        cpu.set_inference_mode();
        accelerated.set_inference_mode();
        let sample = load_sample(&[(30, 25), (4, 12), (11, 9), (2, 40)], 10, 5);
        for bag in &sample.bags {
            let expected = cpu.evaluate(bag, UNKNOWN_LABEL).unwrap();
            let moved = bag.clone().to_device(device);
            let found = accelerated.evaluate(&moved, UNKNOWN_LABEL).unwrap();
            assert_eq!(expected, found);
        }
    }

    #[test]
    fn test_read_width_mismatch() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut config = small_config(10);
        config.read_len += 1;
        let model = MilModel::new(config, Device::Cpu, &mut rng).unwrap();
        let sample = load_sample(&[(3, 3)], 10, 1);
        let err = model.evaluate(&sample.bags[0], UNKNOWN_LABEL).unwrap_err();
        assert!(err.starts_with("Read vectors have width 12"));
    }

    #[test]
    fn test_empty_bag() {
        let model = random_model(10, Device::Cpu, 1);
        let sample = load_sample(&[], 10, 1);
        assert_eq!(
            model.evaluate(&sample.bags[0], UNKNOWN_LABEL),
            Err("Bag contains no loci".to_string())
        );
    }

    #[test]
    fn test_evaluation_does_not_change_parameters() {
        let mut model = random_model(10, Device::Cpu, 1);
        model.set_inference_mode();
        let before = model.params().clone();
        let sample = load_sample(&[(30, 25), (4, 12)], 10, 3);
        let first: Vec<_> = sample
            .bags
            .iter()
            .map(|b| model.evaluate(b, UNKNOWN_LABEL).unwrap())
            .collect();
        let second: Vec<_> = sample
            .bags
            .iter()
            .map(|b| model.evaluate(b, UNKNOWN_LABEL).unwrap())
            .collect();
        assert_eq!(first, second);
        assert_eq!(model.params(), &before);
    }

    #[test]
    fn test_inference_mode_uses_running_statistics() {
        let mut model = random_model(10, Device::Cpu, 1);
        let mut params = random_params(10, 1);
        params.norm_running_mean.fill(0.5);
        params.norm_running_var.fill(4.0);
        model.params = params;
        let sample = load_sample(&[(30, 25), (4, 12), (9, 9)], 10, 1);

        assert_eq!(model.mode(), Mode::Training);
        let training = model.evaluate(&sample.bags[0], UNKNOWN_LABEL).unwrap();
        model.set_inference_mode();
        assert_eq!(model.mode(), Mode::Inference);
        let inference = model.evaluate(&sample.bags[0], UNKNOWN_LABEL).unwrap();
        assert_ne!(training.probability, inference.probability);
    }

    #[test]
    fn test_load_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.model");
        let params = random_params(10, 42);
        save_parameters(&path, &small_config(10), &params).unwrap();

        let mut model = random_model(10, Device::Cpu, 1);
        model.load_parameters(&path).unwrap();
        assert_eq!(model.params(), &params);
        assert_eq!(model.config(), &small_config(10));
    }

    #[test]
    fn test_load_parameters_coverage_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.model");
        save_parameters(&path, &small_config(100), &random_params(100, 42)).unwrap();

        let mut model = random_model(50, Device::Cpu, 1);
        let err = model.load_parameters(&path).unwrap_err();
        assert!(err.contains("trained with coverage 100, but coverage 50 was requested"));
    }
}
