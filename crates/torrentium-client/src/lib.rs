//! Torrentium Client Library
//!
//! This library provides the node-side functionality of Torrentium: the
//! content catalog, search, downloads, peer health, and the request server.

pub mod catalog;
pub mod config;
pub mod downloader;
pub mod health;
pub mod maintenance;
pub mod node;
pub mod repository;
pub mod search;
pub mod seeder;

pub use config::Config;
pub use node::Node;
