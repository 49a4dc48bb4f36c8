pub mod client;
pub mod config;
pub mod dispatcher;
pub mod percentile;
pub mod pool;
pub mod profile;
pub mod radius;
pub mod ramp;
pub mod report;
pub mod results;
pub mod retry;
pub mod runner;
pub mod stats;

pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use percentile::*;
pub use pool::*;
pub use profile::*;
pub use radius::{Credentials, SharedSecret};
pub use ramp::*;
pub use results::*;
pub use retry::*;
pub use runner::*;
pub use stats::*;
