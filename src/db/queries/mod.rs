//! Database queries, grouped by domain

pub mod campaign;
pub mod enrichment;
pub mod logs;
pub mod maintenance;
pub mod report;
