pub mod account;
pub mod audit;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod security;
pub mod storage;
pub mod tasks;
pub mod vault;
