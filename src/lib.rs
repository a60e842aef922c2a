pub mod app;
pub mod config;
pub mod errors;
pub mod game;
pub mod provider;
pub mod room;
pub mod session;
