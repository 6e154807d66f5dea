pub(crate) mod stats;
