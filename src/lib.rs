// Suppress historical clippy lints that predate the -D warnings CI policy.
#![allow(
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;
