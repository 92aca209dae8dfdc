pub mod api;
pub mod catalog;
pub mod cli;
pub mod engine;
pub mod storage;
