//! `marketgrid-provider`
//!
//! **Responsibility:** the composition root. Wires snapshot sync and guarded
//! inference together behind [`DataService`], and supplies the HTTP
//! collaborators plus configuration the `marketgrid` binary runs with.

pub mod config;
pub mod http;
pub mod provider;
pub mod worker;

pub use config::{ConfigError, ProviderConfig};
pub use http::{
    CredentialSlot, EnvCredentialRecalibrator, HttpInferenceBackend, HttpSnapshotSource,
    build_provider,
};
pub use provider::{DataProvider, DataProviderBuilder, DataService};
pub use worker::RefreshWorker;
