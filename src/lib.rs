// Library exports for the binary and for testing
pub mod aggregate;
pub mod analyze;
pub mod cache;
pub mod config;
pub mod crosstab;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod login;
pub mod logout;
pub mod model;
pub mod progress;
pub mod query;
pub mod reconcile;
pub mod renderer;
pub mod secrets;
pub mod selector;
pub mod status;
pub mod timefmt;
pub mod wiql;
pub mod window;
