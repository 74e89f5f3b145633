// src/lib.rs
pub mod audit;
pub mod canonical;
pub mod config;
pub mod error;
pub mod extraction;
pub mod geocoding;
pub mod matching;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod review;
pub mod store;
pub mod utils;
