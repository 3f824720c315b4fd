use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
}

pub fn summarize(data: &[f64]) -> Option<Summary> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let len = sorted.len();
    let median = if len % 2 == 0 {
        (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
    } else {
        sorted[len / 2]
    };
    let mean = sorted.iter().sum::<f64>() / len as f64;
    let std_dev = (sorted.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / len as f64).sqrt();
    Some(Summary {
        min: sorted[0],
        max: sorted[len - 1],
        mean,
        median,
        std_dev,
    })
}
