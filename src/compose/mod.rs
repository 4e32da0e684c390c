//! Compose-style stack definitions
//!
//! Parses stack files into the [`Stack`](crate::stack::Stack) model. Later
//! files layer over earlier ones service by service.

pub mod config;
pub mod convert;
pub mod duration;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use convert::DEFAULT_NETWORK;
pub use duration::{format_duration, parse_duration};
pub use parser::ComposeParser;
