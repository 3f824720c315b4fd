use super::{Bag, SampleData};
use crate::utils::{read_f32_array, read_i64_array, Result};
use crossbeam_channel::{bounded, Receiver};
use itertools::Itertools;
use rand::rngs::StdRng;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

/// Label value used for samples whose MSI status is not known. It is only
/// forwarded to the classifier's loss head and never read as ground truth.
pub const UNKNOWN_LABEL: i64 = -1;
pub const DEFAULT_REPEAT_COUNT: usize = 100;
pub const DEFAULT_COVERAGE: usize = 50;

const DATA_SUFFIX: &str = "_data.npy";
const INDEX_SUFFIX: &str = "_index.npy";
const GZIP_EXTENSION: &str = ".gz";

#[derive(Debug, Clone, PartialEq)]
pub struct BagConfig {
    pub repeat_count: usize,
    pub coverage: usize,
    pub training: bool,
    pub shuffle: bool,
}

impl Default for BagConfig {
    fn default() -> Self {
        BagConfig {
            repeat_count: DEFAULT_REPEAT_COUNT,
            coverage: DEFAULT_COVERAGE,
            training: false,
            shuffle: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleEntry {
    pub sample_id: String,
    pub label: i64,
    pub data_path: PathBuf,
    pub index_path: PathBuf,
}

#[derive(Debug)]
pub struct SampleBags {
    pub sample_id: String,
    pub label: i64,
    pub bags: Vec<Bag>,
}

/// Yields every sample under a vector location together with its resampled
/// bags, in file-name order.
pub struct BagSource {
    entries: std::vec::IntoIter<SampleEntry>,
    config: BagConfig,
    rng: StdRng,
}

impl BagSource {
    pub fn new(vector_location: &Path, config: BagConfig, rng: StdRng) -> Result<Self> {
        if config.coverage == 0 {
            return Err("Coverage must be at least 1".to_string());
        }
        let entries = scan_vector_location(vector_location)?;
        for entry in &entries {
            check_label(entry, config.training)?;
        }
        log::info!(
            "Found {} sample(s) in {}",
            entries.len(),
            vector_location.display()
        );
        Ok(BagSource {
            entries: entries.into_iter(),
            config,
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads samples on a background thread, keeping at most `buffer` loaded
    /// samples ahead of the consumer. Samples arrive in the same order and
    /// with the same bags as sequential iteration.
    pub fn prefetch(self, buffer: usize) -> Prefetched {
        let (sender, receiver) = bounded(buffer);
        let handle = thread::Builder::new()
            .name("mimsi-loader".to_string())
            .spawn(move || {
                for sample in self {
                    let failed = sample.is_err();
                    if sender.send(sample).is_err() || failed {
                        break;
                    }
                }
            });
        match handle {
            Ok(handle) => Prefetched {
                receiver,
                handle: Some(handle),
                spawn_error: None,
            },
            Err(e) => Prefetched {
                receiver,
                handle: None,
                spawn_error: Some(format!("Failed to start sample loader: {}", e)),
            },
        }
    }
}

impl Iterator for BagSource {
    type Item = Result<SampleBags>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        Some(load_sample(&entry, &self.config, &mut self.rng))
    }
}

pub struct Prefetched {
    receiver: Receiver<Result<SampleBags>>,
    handle: Option<JoinHandle<()>>,
    spawn_error: Option<String>,
}

impl Iterator for Prefetched {
    type Item = Result<SampleBags>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.spawn_error.take() {
            return Some(Err(err));
        }
        match self.receiver.recv() {
            Ok(sample) => Some(sample),
            Err(_) => {
                // Channel closed: the loader either finished or died.
                let handle = self.handle.take()?;
                match handle.join() {
                    Ok(()) => None,
                    Err(_) => Some(Err("Sample loader thread panicked".to_string())),
                }
            }
        }
    }
}

fn load_sample(entry: &SampleEntry, config: &BagConfig, rng: &mut StdRng) -> Result<SampleBags> {
    let reads = read_f32_array(&entry.data_path)?;
    let counts = read_i64_array(&entry.index_path)?;
    let data = SampleData::from_arrays(reads, counts)
        .map_err(|e| format!("Sample {}: {}", entry.sample_id, e))?;
    log::debug!(
        "{}: {} loci, {} read vectors",
        entry.sample_id,
        data.loci().len(),
        data.num_reads()
    );

    let data = Arc::new(data);
    let bags = (0..config.repeat_count)
        .map(|_| Bag::draw(&data, config.coverage, config.shuffle, rng))
        .collect();

    Ok(SampleBags {
        sample_id: entry.sample_id.clone(),
        label: entry.label,
        bags,
    })
}

fn check_label(entry: &SampleEntry, training: bool) -> Result<()> {
    match entry.label {
        0 | 1 => Ok(()),
        UNKNOWN_LABEL if !training => Ok(()),
        label => Err(format!(
            "Sample {} has label {} in {}; expected 0 or 1{}",
            entry.sample_id,
            label,
            entry.data_path.display(),
            if training { "" } else { " or -1 (unknown)" }
        )),
    }
}

pub fn scan_vector_location(root: &Path) -> Result<Vec<SampleEntry>> {
    let dir = fs::read_dir(root)
        .map_err(|e| format!("Cannot read vector location {}: {}", root.display(), e))?;

    let mut entries = Vec::new();
    for item in dir {
        let path = item
            .map_err(|e| format!("Cannot read vector location {}: {}", root.display(), e))?
            .path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = data_file_stem(file_name) else {
            continue;
        };
        // A sample stored both plain and gzipped is read from the plain file once.
        if file_name.ends_with(GZIP_EXTENSION)
            && root.join(format!("{}{}", stem, DATA_SUFFIX)).exists()
        {
            log::warn!(
                "Ignoring {} in favor of the uncompressed data file",
                path.display()
            );
            continue;
        }
        let (sample_id, label) = parse_sample_stem(stem)?;
        let index_path = find_index_file(root, stem)?;
        entries.push(SampleEntry {
            sample_id: sample_id.to_string(),
            label,
            data_path: path.clone(),
            index_path,
        });
    }

    entries.sort_by(|a, b| a.data_path.cmp(&b.data_path));
    if let Some(duplicate) = entries.iter().duplicates_by(|e| &e.sample_id).next() {
        return Err(format!(
            "Sample {} has more than one data file in {}",
            duplicate.sample_id,
            root.display()
        ));
    }
    Ok(entries)
}

fn data_file_stem(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(GZIP_EXTENSION)
        .unwrap_or(file_name)
        .strip_suffix(DATA_SUFFIX)
}

fn find_index_file(root: &Path, stem: &str) -> Result<PathBuf> {
    let plain = root.join(format!("{}{}", stem, INDEX_SUFFIX));
    if plain.exists() {
        return Ok(plain);
    }
    let gzipped = root.join(format!("{}{}{}", stem, INDEX_SUFFIX, GZIP_EXTENSION));
    if gzipped.exists() {
        return Ok(gzipped);
    }
    Err(format!("Locus index not found: {}", plain.display()))
}

/// Splits `<sample_id>_<label>` on the last underscore.
fn parse_sample_stem(stem: &str) -> Result<(&str, i64)> {
    let error_msg = || format!("Vector file name must be <sample>_<label>: {}", stem);
    let (sample_id, label) = stem.rsplit_once('_').ok_or_else(error_msg)?;
    if sample_id.is_empty() {
        return Err(error_msg());
    }
    let label = label.parse::<i64>().map_err(|_| error_msg())?;
    Ok((sample_id, label))
}
