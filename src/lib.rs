pub mod config;
pub mod fetch;
pub mod integrity;
pub mod manifest;
pub mod pipeline;
pub mod provision;
pub mod supervisor;
pub mod task;
pub mod update_check;
pub mod utils;
