pub mod api;
pub mod config;
pub mod credentials;
pub mod csrf;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod upstream;
pub mod validation;
pub mod xml;
