mod auth;
mod classification;
mod decoder;
mod model_service;
mod ort_service;
mod routes;
mod server;
mod telemetry;
mod tensor;

pub mod app;
pub mod config;

pub use app::start_app;
