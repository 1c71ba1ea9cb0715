#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod gate;
pub mod http;
pub mod presence;
pub mod router;

#[cfg(test)]
mod presence_tests;
