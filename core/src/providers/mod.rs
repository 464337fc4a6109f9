pub mod adapters;
pub mod registry;
pub mod seeds;

pub use adapters::{ChatBackend, HttpBackends};
pub use registry::{ProviderInfo, ProviderProfile};
