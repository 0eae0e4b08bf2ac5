pub mod create;
pub mod exec;
pub mod get;
pub mod list;
pub mod pull;
pub mod push;
pub mod remove;
pub mod resolve;
pub mod update_hosts;
