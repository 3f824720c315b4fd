use crate::cli::EvaluateArgs;
use crate::mimsi::{
    bags::{BagConfig, BagSource},
    model::{MilModel, ModelConfig},
    workflows::{evaluate_samples, RunResults},
    writers::{ResultsWriter, SavedResults},
};
use crate::utils::{Device, Result};
use rand::{rngs::StdRng, SeedableRng};
use std::io::Write;

const PREFETCH_BUFFER: usize = 1;

pub fn evaluate(args: EvaluateArgs) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    run(args, &mut stdout).map(|_| ())
}

/// Wires the bag source, the classifier and the results writer together and
/// runs a full evaluation, writing progress lines to `progress`.
pub fn run<W: Write>(args: EvaluateArgs, progress: &mut W) -> Result<Option<SavedResults>> {
    let device = Device::resolve(args.no_cuda, args.num_threads);
    if device.is_accelerated() {
        log::info!("Accelerated execution enabled: {}", device);
    }
    log::info!("Evaluating samples in {}", args.vector_location.display());

    // One seeded generator drives model initialization and bag resampling.
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut model = MilModel::new(ModelConfig::for_coverage(args.coverage), device, &mut rng)?;
    model.load_parameters(&args.saved_model)?;

    let bag_config = BagConfig {
        repeat_count: args.repeats,
        coverage: args.coverage,
        training: false,
        shuffle: false,
    };
    let source = BagSource::new(&args.vector_location, bag_config, rng)?;
    if source.is_empty() {
        log::warn!("No samples found in {}", args.vector_location.display());
    }

    let results: RunResults = if device.is_accelerated() {
        evaluate_samples(&mut model, source.prefetch(PREFETCH_BUFFER), progress)?
    } else {
        evaluate_samples(&mut model, source, progress)?
    };

    if !args.save {
        return Ok(None);
    }
    let writer = ResultsWriter::new(&args.output_dir, &args.name);
    writer.write(&results).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::mimsi::fixtures::write_sample;
    use crate::mimsi::model::{save_parameters, MilParams};
    use crate::utils::read_f32_array;
    use clap::Parser;
    use std::path::Path;

    const COVERAGE: usize = 50;

    fn write_model(path: &Path) {
        let config = ModelConfig::for_coverage(COVERAGE);
        let params = MilParams::initialize(&config, &mut StdRng::seed_from_u64(17));
        save_parameters(path, &config, &params).unwrap();
    }

    /// Samples with full-width (40 x 3) read vectors, as the default model expects.
    fn write_full_sample(dir: &Path, sample_id: &str, seed: u64) {
        use crate::utils::npy;
        use rand::Rng;
        use std::fs::File;

        let counts = [(60usize, 55usize), (20, 70), (8, 9)];
        let mut rng = StdRng::seed_from_u64(seed);
        let num_reads: usize = counts.iter().map(|(t, n)| t + n).sum();
        let reads: Vec<f32> = (0..num_reads * 120)
            .map(|_| rng.random_range(0.0..1.0))
            .collect();
        let index: Vec<i64> = counts
            .iter()
            .flat_map(|&(t, n)| [t as i64, n as i64])
            .collect();
        let mut data = File::create(dir.join(format!("{}_-1_data.npy", sample_id))).unwrap();
        npy::write_f32(&mut data, &[num_reads, 40, 3], &reads).unwrap();
        let mut idx = File::create(dir.join(format!("{}_-1_index.npy", sample_id))).unwrap();
        npy::write_i64(&mut idx, &[counts.len(), 2], &index).unwrap();
    }

    fn args(vectors: &Path, model: &Path, output: &Path, extra: &[&str]) -> EvaluateArgs {
        let mut argv = vec![
            "mimsi".to_string(),
            "--vector-location".to_string(),
            vectors.display().to_string(),
            "--saved-model".to_string(),
            model.display().to_string(),
            "--output-dir".to_string(),
            output.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        Cli::try_parse_from(argv).unwrap().args
    }

    struct Workspace {
        _root: tempfile::TempDir,
        vectors: std::path::PathBuf,
        output: std::path::PathBuf,
        model: std::path::PathBuf,
    }

    fn workspace(samples: &[&str]) -> Workspace {
        let root = tempfile::tempdir().unwrap();
        let vectors = root.path().join("eval");
        let output = root.path().join("out");
        std::fs::create_dir(&vectors).unwrap();
        std::fs::create_dir(&output).unwrap();
        for (i, id) in samples.iter().enumerate() {
            write_full_sample(&vectors, id, i as u64);
        }
        let model = root.path().join("mimsi_mskcc_impact.model");
        write_model(&model);
        Workspace {
            _root: root,
            vectors,
            output,
            model,
        }
    }

    #[test]
    fn test_single_sample_run() {
        let ws = workspace(&["P-0000001-T01"]);
        let mut progress = Vec::new();
        let saved = run(
            args(&ws.vectors, &ws.model, &ws.output, &["--save"]),
            &mut progress,
        )
        .unwrap();

        let path = ws.output.join("P-0000001-T01_results.npy");
        assert_eq!(saved, Some(SavedResults::Sample(path.clone())));
        let probabilities = read_f32_array(&path).unwrap();
        assert_eq!(probabilities.shape(), &[100]);
        assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));

        let progress = String::from_utf8(progress).unwrap();
        assert_eq!(progress.lines().count(), 1);
        let (id, sequence) = progress.trim_end().split_once('\t').unwrap();
        assert_eq!(id, "P-0000001-T01");
        assert_eq!(sequence.split(", ").count(), 100);
    }

    #[test]
    fn test_three_samples_saved_under_run_name() {
        let ws = workspace(&["S1", "S2", "S3"]);
        let mut progress = Vec::new();
        let saved = run(
            args(
                &ws.vectors,
                &ws.model,
                &ws.output,
                &["--save", "--name", "run42", "--repeats", "10"],
            ),
            &mut progress,
        )
        .unwrap();

        assert_eq!(
            saved,
            Some(SavedResults::Run(ws.output.join("run42_results.npy")))
        );
        let ids: Vec<_> = String::from_utf8(progress)
            .unwrap()
            .lines()
            .map(|l| l.split('\t').next().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["S1", "S2", "S3"]);
    }

    #[test]
    fn test_no_file_without_save() {
        let ws = workspace(&["S1", "S2"]);
        let saved = run(
            args(&ws.vectors, &ws.model, &ws.output, &["--repeats", "5"]),
            &mut std::io::sink(),
        )
        .unwrap();
        assert_eq!(saved, None);
        assert_eq!(std::fs::read_dir(&ws.output).unwrap().count(), 0);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let ws = workspace(&["S1", "S2"]);
        let mut first = Vec::new();
        let mut second = Vec::new();
        let extra = ["--repeats", "10"];
        run(args(&ws.vectors, &ws.model, &ws.output, &extra), &mut first).unwrap();
        run(args(&ws.vectors, &ws.model, &ws.output, &extra), &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_accelerated_run_matches_cpu() {
        let ws = workspace(&["S1", "S2"]);
        let mut cpu = Vec::new();
        let mut accelerated = Vec::new();
        let extra = ["--repeats", "5"];
        run(args(&ws.vectors, &ws.model, &ws.output, &extra), &mut cpu).unwrap();
        run(
            args(
                &ws.vectors,
                &ws.model,
                &ws.output,
                &["--repeats", "5", "--threads", "2"],
            ),
            &mut accelerated,
        )
        .unwrap();
        assert_eq!(cpu, accelerated);
    }

    #[test]
    fn test_coverage_mismatch_is_fatal() {
        let ws = workspace(&["S1"]);
        let result = run(
            args(
                &ws.vectors,
                &ws.model,
                &ws.output,
                &["--save", "--coverage", "100"],
            ),
            &mut std::io::sink(),
        );
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(&ws.output).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let ws = workspace(&["S1"]);
        let missing = ws.output.join("absent.model");
        let err = run(
            args(&ws.vectors, &missing, &ws.output, &[]),
            &mut std::io::sink(),
        )
        .unwrap_err();
        assert!(err.starts_with("Failed to open model file"));
    }

    #[test]
    fn test_evaluation_error_saves_nothing() {
        let ws = workspace(&["S1"]);
        // Narrow read vectors the default model cannot take.
        write_sample(&ws.vectors, "S2", -1, &[(12, 9), (4, 30)], 3);
        let mut progress = Vec::new();
        let err = run(
            args(
                &ws.vectors,
                &ws.model,
                &ws.output,
                &["--save", "--repeats", "5"],
            ),
            &mut progress,
        )
        .unwrap_err();

        assert!(err.starts_with("Sample S2: bag 1/5: Read vectors have width 12"));
        let progress = String::from_utf8(progress).unwrap();
        assert_eq!(progress.lines().count(), 1);
        assert!(progress.starts_with("S1\t["));
        assert_eq!(std::fs::read_dir(&ws.output).unwrap().count(), 0);
    }

    #[test]
    fn test_sample_without_loci_saves_nothing() {
        let ws = workspace(&["S1"]);
        write_sample(&ws.vectors, "S0", -1, &[], 3);
        let err = run(
            args(&ws.vectors, &ws.model, &ws.output, &["--save"]),
            &mut std::io::sink(),
        )
        .unwrap_err();
        assert_eq!(err, "Sample S0: bag 1/100: Bag contains no loci");
        assert_eq!(std::fs::read_dir(&ws.output).unwrap().count(), 0);
    }
}
