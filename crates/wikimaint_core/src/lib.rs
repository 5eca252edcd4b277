pub mod applier;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod interrupt;
pub mod lag;
pub mod report;
pub mod retry;
pub mod row;
pub mod run;
pub mod sqlite;
pub mod tasks;
