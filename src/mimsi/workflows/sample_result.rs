use crate::utils::{summarize, Summary};
use std::fmt;

/// Probabilities of one sample, one per resampled bag, in evaluation order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleResult {
    pub sample_id: String,
    pub probabilities: Vec<f64>,
}

impl SampleResult {
    pub fn summary(&self) -> Option<Summary> {
        summarize(&self.probabilities)
    }
}

/// Progress line: sample id, a tab, then the probability list.
impl fmt::Display for SampleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{:?}", self.sample_id, self.probabilities)
    }
}

/// Append-only collection of sample results in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResults {
    records: Vec<SampleResult>,
}

impl RunResults {
    pub fn push(&mut self, record: SampleResult) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[SampleResult] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
