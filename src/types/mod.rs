//! Type definitions

pub mod company;
pub mod log;
pub mod messages;

pub use company::*;
pub use log::*;
pub use messages::*;
