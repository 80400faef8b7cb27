pub mod placeholder;
pub mod service;

pub use placeholder::{PlaceholderContext, PlaceholderKind};
