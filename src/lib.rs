pub mod filter;
pub mod observable;
pub mod calibration;
pub mod volume;
pub mod counter;
pub mod traits;
pub mod controller;
pub mod command;
pub mod status;
pub mod config;
pub mod error;
pub mod sim;
