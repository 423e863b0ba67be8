pub mod ast;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod kernel;
