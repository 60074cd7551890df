pub mod bus;
pub mod bus_ingest;
pub mod bus_publisher;
pub mod config;
pub mod file_store;
pub mod host;
pub mod plugin;
pub mod protocol_sync;
pub mod settings;
pub mod supervisor;
pub mod telemetry;
