pub(crate) mod batch;
pub(crate) mod submission;
