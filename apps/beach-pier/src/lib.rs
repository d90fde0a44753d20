pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod ids;
pub mod mcu;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod rtm;
pub mod telemetry;
