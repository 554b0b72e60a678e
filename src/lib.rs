// src/lib.rs
pub mod ports {
    pub mod csv_prices;
    pub mod replay_gateway;
}
pub mod config;
pub mod error;
pub mod gateway;
pub mod hedge;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod prices;
pub mod report;
pub mod selector;
pub mod stationarity;

pub use error::{EngineError, EngineResult};
