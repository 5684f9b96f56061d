pub mod config;
pub mod control;
pub mod core;
pub mod events;
pub mod reads;
pub mod source;
