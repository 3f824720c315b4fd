mod bag;
mod source;

pub use bag::{Bag, Instance, LocusSpan, SampleData};
pub use source::{
    scan_vector_location, BagConfig, BagSource, Prefetched, SampleBags, SampleEntry,
    DEFAULT_COVERAGE, DEFAULT_REPEAT_COUNT, UNKNOWN_LABEL,
};
