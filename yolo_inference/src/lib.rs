mod codec;
mod inference_service;
mod labels;
mod model_service;
mod ort_service;
mod params;
mod routes;
mod runtime;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod error;

pub use app::start_app;
