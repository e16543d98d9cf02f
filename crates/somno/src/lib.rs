pub mod client;
pub mod daemon;
pub mod db;
pub mod error;
pub mod id;
pub mod output;
pub mod storage;
pub mod translate;
pub mod types;
