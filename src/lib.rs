pub mod config;
pub mod domain;
pub mod http;
pub mod medium;
pub mod store;
pub mod version;
