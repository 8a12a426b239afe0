pub mod config;
pub mod connectivity;
pub mod events;
pub mod failure;
pub mod monitor;
pub mod pause_window;
pub mod portal;
pub mod retry;
pub mod session;
pub mod utils;
