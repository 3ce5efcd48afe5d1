pub mod autosave;
pub mod clip;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod notice;
pub mod poller;
pub mod router;
pub mod routes;
pub mod send;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
pub mod uploader;
