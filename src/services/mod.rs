//! Business services

pub mod cron;
pub mod enrichment;
pub mod logger;
pub mod rate_limit;
