pub(crate) mod batches;
pub(crate) mod exams;
pub(crate) mod grade_edits;
pub(crate) mod grading_results;
pub(crate) mod health;
pub(crate) mod memory;
pub(crate) mod store;
pub(crate) mod submissions;

pub(crate) use memory::MemoryStore;
pub(crate) use store::{GradingStore, PgStore};
