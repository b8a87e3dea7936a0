pub mod config;
pub mod pipeline;
pub mod run;
pub mod stage;
pub mod time_window;
pub mod upload;
