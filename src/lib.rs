pub mod api;
pub mod auth;
pub mod config;
pub mod container;
pub mod detect;
pub mod path_translator;
pub mod provider;
pub mod repository;
pub mod server;
pub mod service;

#[cfg(test)]
mod api_test;
