mod mil;
mod params;

pub use mil::{BagClassifier, Evaluation, MilModel, Mode};
pub use params::{load_parameters, save_parameters, MilParams, ModelConfig, FORMAT_VERSION};
