pub mod job;
pub mod summary;
