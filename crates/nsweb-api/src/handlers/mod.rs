//! HTTP handlers for nsweb-api.

pub mod decode;
pub mod health;
pub mod locations;
