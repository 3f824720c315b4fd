//! Defines the `ResultsWriter` struct which persists the probabilities of a run as an `.npy` array.
//!
//! The shape of the saved array depends on how many samples were evaluated:
//! a run with exactly one sample stores only that sample's probabilities as a
//! 1-D `<f8` array in `<sample_id>_results.npy`. Any other run stores a
//! structured array of `(sample_id, probabilities)` rows in
//! `<name>_results.npy`. Readers of these files must check the shape.

use crate::mimsi::workflows::RunResults;
use crate::utils::{npy, results_path, Result};
use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// What was written and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedResults {
    /// Probabilities of the only sample in the run.
    Sample(PathBuf),
    /// Every `(sample_id, probabilities)` pair of the run.
    Run(PathBuf),
}

impl SavedResults {
    pub fn path(&self) -> &Path {
        match self {
            SavedResults::Sample(path) | SavedResults::Run(path) => path,
        }
    }
}

/// Structure for saving run results once evaluation has finished.
pub struct ResultsWriter {
    /// Directory receiving the results file.
    output_dir: PathBuf,
    /// Stem of the results file for runs that do not have exactly one sample.
    run_name: String,
}

impl ResultsWriter {
    /// Constructs a new `ResultsWriter` instance.
    ///
    /// # Arguments
    /// * `output_dir` - Existing directory receiving the results file.
    /// * `run_name` - File stem used when the run does not have exactly one sample.
    pub fn new(output_dir: &Path, run_name: &str) -> Self {
        ResultsWriter {
            output_dir: output_dir.to_path_buf(),
            run_name: run_name.to_string(),
        }
    }

    /// Returns the file the given results would be saved to.
    pub fn target(&self, results: &RunResults) -> SavedResults {
        match results.records() {
            [single] => SavedResults::Sample(results_path(&self.output_dir, &single.sample_id)),
            _ => SavedResults::Run(results_path(&self.output_dir, &self.run_name)),
        }
    }

    /// Writes the whole run in one go.
    ///
    /// The payload goes to a hidden temporary file in the output directory
    /// that is renamed over the target once complete, so an interrupted write
    /// never leaves a partial results file behind.
    ///
    /// # Returns
    /// Returns a `Result` with the saved target or an error message. A failed
    /// write is never retried elsewhere.
    pub fn write(&self, results: &RunResults) -> Result<SavedResults> {
        let target = self.target(results);
        let path = target.path();
        let temp_path = self.temp_path(path);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| format!("Failed to create results file {}: {}", path.display(), e))?;
        let written = write_payload(BufWriter::new(file), &target, results)
            .map_err(|e| format!("Failed to write results file {}: {}", path.display(), e));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            format!("Failed to move results into {}: {}", path.display(), e)
        })?;
        log::info!("Saved results to {}", path.display());
        Ok(target)
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.output_dir
            .join(format!(".{}.{}.tmp", file_name, std::process::id()))
    }
}

fn write_payload<W: Write>(mut writer: W, target: &SavedResults, results: &RunResults) -> Result<()> {
    match target {
        SavedResults::Sample(_) => {
            let probabilities = &results.records()[0].probabilities;
            npy::write_f64(&mut writer, &[probabilities.len()], probabilities)?;
        }
        SavedResults::Run(_) => {
            let rows = results
                .records()
                .iter()
                .map(|r| (r.sample_id.as_str(), r.probabilities.as_slice()))
                .collect::<Vec<_>>();
            npy::write_labelled_rows(&mut writer, &rows)?;
        }
    }
    writer.flush().map_err(|e| e.to_string())
}
