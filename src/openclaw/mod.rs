pub mod auth;
pub mod config;
pub mod delivery;
pub mod gateway;
pub mod paths;
