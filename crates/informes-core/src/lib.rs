//! Client-side session lifecycle for the informes API: login, persisted
//! credentials, single-flight renewal, scheduled renewal and authenticated requests.

pub mod api;
pub mod auth;
pub mod config;
pub mod services;
