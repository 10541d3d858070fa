pub mod config;
pub mod engine;
pub mod job;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod worker;
pub mod workspace;
