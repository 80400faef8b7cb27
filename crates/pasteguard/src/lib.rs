pub mod config;
pub mod detect;
pub mod extract;
pub mod mask;
pub mod parse;
pub mod providers;
pub mod proxy;
pub mod route;
pub mod telemetry;
