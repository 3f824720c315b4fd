mod evaluate;
mod sample_result;

pub use evaluate::evaluate_samples;
pub use sample_result::{RunResults, SampleResult};
