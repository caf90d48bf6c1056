pub mod backtest;
pub mod calibration;
pub mod kelly;
pub mod patterns;
pub mod strategy;
pub mod wager;
pub mod zones;

pub use strategy::{AdvisorEngine, DashboardSnapshot, EngineCommand, EngineConfig, EngineOutputs};
