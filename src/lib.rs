pub mod clients;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod persistence;
pub mod routes;
pub mod ws;
