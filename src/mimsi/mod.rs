pub mod bags;
pub mod model;
pub mod workflows;
pub mod writers;

#[cfg(test)]
pub(crate) mod fixtures;
