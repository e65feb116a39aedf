pub mod logger;
pub mod state;
pub mod ui;
