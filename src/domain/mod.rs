pub mod listeners;
pub mod models;
pub mod settings;
