//! Server wiring for Vigil: configuration, the store-driven snapshot feed,
//! rule seed files and the background runtime.

pub mod app;
pub mod config;
pub mod feed;
pub mod seed;
