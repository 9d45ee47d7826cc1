pub mod client;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod events;
pub mod legacy;
pub mod missions;
pub mod model;
pub mod parser;
pub mod scheduler;
pub mod settings;
pub mod worker;
