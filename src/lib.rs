pub mod api;
pub mod category;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod model;
pub mod object_store;
pub mod retry;
pub mod steps;
pub mod unsplash;
