use crate::mimsi::model::{MilModel, MilParams, ModelConfig};
use crate::utils::{npy, Device};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fs::File, path::Path};

pub const READ_LEN: usize = 4;
pub const CHANNELS: usize = 3;

pub fn small_config(coverage: usize) -> ModelConfig {
    ModelConfig {
        coverage,
        read_len: READ_LEN,
        channels: CHANNELS,
        read_hidden: 8,
        instance_hidden: 6,
        attention_hidden: 4,
    }
}

/// Writes `<sample_id>_<label>_data.npy` and `<sample_id>_<label>_index.npy`
/// with random read vectors for the given per-locus (tumor, normal) counts.
pub fn write_sample(dir: &Path, sample_id: &str, label: i64, counts: &[(usize, usize)], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_reads: usize = counts.iter().map(|(t, n)| t + n).sum();
    let reads: Vec<f32> = (0..num_reads * READ_LEN * CHANNELS)
        .map(|_| rng.random_range(0.0..1.0))
        .collect();
    let index: Vec<i64> = counts
        .iter()
        .flat_map(|&(t, n)| [t as i64, n as i64])
        .collect();

    let stem = format!("{}_{}", sample_id, label);
    let mut data_file = File::create(dir.join(format!("{}_data.npy", stem))).unwrap();
    npy::write_f32(&mut data_file, &[num_reads, READ_LEN, CHANNELS], &reads).unwrap();
    let mut index_file = File::create(dir.join(format!("{}_index.npy", stem))).unwrap();
    npy::write_i64(&mut index_file, &[counts.len(), 2], &index).unwrap();
}

pub fn random_model(coverage: usize, device: Device, seed: u64) -> MilModel {
    let mut rng = StdRng::seed_from_u64(seed);
    MilModel::new(small_config(coverage), device, &mut rng).unwrap()
}

pub fn random_params(coverage: usize, seed: u64) -> MilParams {
    let mut rng = StdRng::seed_from_u64(seed);
    MilParams::initialize(&small_config(coverage), &mut rng)
}
