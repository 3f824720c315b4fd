use crate::utils::{Device, Result};
use itertools::Itertools;
use ndarray::{Array2, ArrayD, Axis, Ix2, Ix3};
use rand::{
    seq::{index, SliceRandom},
    Rng,
};
use std::{ops::Range, sync::Arc};

/// Read rows of one locus, tumor reads followed by normal reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocusSpan {
    pub tumor: Range<usize>,
    pub normal: Range<usize>,
}

/// All read vectors of one sample, flattened to `[reads, read_len * channels]`.
#[derive(Debug)]
pub struct SampleData {
    reads: Array2<f32>,
    loci: Vec<LocusSpan>,
}

impl SampleData {
    /// Builds sample data from a `[reads, read_len, channels]` array and a
    /// `[loci, 2]` array of per-locus tumor and normal read counts.
    pub fn from_arrays(reads: ArrayD<f32>, counts: ArrayD<i64>) -> Result<Self> {
        let reads = reads
            .into_dimensionality::<Ix3>()
            .map_err(|_| "Read vectors must have shape [reads, read_len, channels]".to_string())?;
        let (num_reads, read_len, channels) = reads.dim();
        let reads = reads
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((num_reads, read_len * channels))
            .map_err(|e| e.to_string())?;

        if counts.ndim() != 2 || counts.shape()[1] != 2 {
            return Err(format!(
                "Locus index must have shape [loci, 2], found {:?}",
                counts.shape()
            ));
        }
        let counts = counts
            .into_dimensionality::<Ix2>()
            .map_err(|e| e.to_string())?;

        let mut loci = Vec::with_capacity(counts.shape()[0]);
        let mut offset = 0;
        for (locus_index, row) in counts.outer_iter().enumerate() {
            let to_count = |value: i64| {
                usize::try_from(value).map_err(|_| {
                    format!(
                        "Negative read count {} at locus {}",
                        value,
                        locus_index + 1
                    )
                })
            };
            let tumor_count = to_count(row[0])?;
            let normal_count = to_count(row[1])?;
            let tumor = offset..offset + tumor_count;
            let normal = tumor.end..tumor.end + normal_count;
            offset = normal.end;
            loci.push(LocusSpan { tumor, normal });
        }

        if offset != num_reads {
            return Err(format!(
                "Locus index accounts for {} reads but {} read vectors were found",
                offset, num_reads
            ));
        }

        Ok(SampleData { reads, loci })
    }

    pub fn loci(&self) -> &[LocusSpan] {
        &self.loci
    }

    pub fn num_reads(&self) -> usize {
        self.reads.nrows()
    }

    pub fn read_width(&self) -> usize {
        self.reads.ncols()
    }

    pub fn select_reads(&self, rows: &[usize]) -> Array2<f32> {
        self.reads.select(Axis(0), rows)
    }
}

/// One locus of a bag: the read rows drawn for the tumor and the normal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub tumor: Vec<usize>,
    pub normal: Vec<usize>,
}

/// A single coverage-capped draw of a sample's loci.
///
/// Bags share their sample's read vectors and hold read indices only, so
/// moving a bag to another device changes its placement, not its data.
#[derive(Debug, Clone)]
pub struct Bag {
    data: Arc<SampleData>,
    instances: Vec<Instance>,
    device: Device,
}

impl Bag {
    pub fn new(data: Arc<SampleData>, instances: Vec<Instance>) -> Self {
        Bag {
            data,
            instances,
            device: Device::Cpu,
        }
    }

    pub fn draw<R: Rng + ?Sized>(
        data: &Arc<SampleData>,
        coverage: usize,
        shuffle: bool,
        rng: &mut R,
    ) -> Self {
        let mut instances = data
            .loci()
            .iter()
            .map(|locus| Instance {
                tumor: cap_reads(locus.tumor.clone(), coverage, rng),
                normal: cap_reads(locus.normal.clone(), coverage, rng),
            })
            .collect_vec();
        if shuffle {
            instances.shuffle(rng);
        }
        Bag::new(Arc::clone(data), instances)
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn read_width(&self) -> usize {
        self.data.read_width()
    }

    pub fn num_reads(&self) -> usize {
        self.instances
            .iter()
            .map(|i| i.tumor.len() + i.normal.len())
            .sum()
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }
}

/// Uniformly picks `coverage` rows without replacement when the span holds
/// more reads than that; otherwise keeps every read.
fn cap_reads<R: Rng + ?Sized>(span: Range<usize>, coverage: usize, rng: &mut R) -> Vec<usize> {
    if span.len() <= coverage {
        return span.collect();
    }
    let mut picked = index::sample(rng, span.len(), coverage).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| span.start + i).collect()
}
