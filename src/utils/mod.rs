mod device;
mod math;
pub mod npy;
mod readers;
mod util;

pub use device::Device;
pub use math::{summarize, Summary};
pub use readers::{open_npy_reader, read_f32_array, read_i64_array};
pub use util::{handle_error_and_exit, results_path, Result};
