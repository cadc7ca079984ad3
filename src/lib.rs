#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod courses;
pub mod error;
pub mod gateway;
