pub mod approval;
pub mod claims;
pub mod config;
pub mod context;
pub mod dirs;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod identity;
pub mod logs;
pub mod model;
pub mod restful;
pub mod response;
pub mod rsa;
pub mod session;
pub mod store;
pub mod triggers;
