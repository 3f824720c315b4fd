mod write_results;

pub use write_results::{ResultsWriter, SavedResults};
