pub mod canonical;
pub mod catalog;
pub mod checklist;
pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod paths;
pub mod report;
pub mod scoring;
pub mod stage;
pub mod thirdparty;
