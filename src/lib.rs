pub mod browser;
pub mod cli;
pub mod crawler;
pub mod forms;
pub mod storage;
pub mod utils;
