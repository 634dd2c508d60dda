pub mod assignments;
pub mod attendance;
pub mod auth;
pub mod backup;
pub mod core;
pub mod lookups;
pub mod messages;
pub mod org;
pub mod progress;
pub mod registration;
pub mod scores;
pub mod tasks;
pub mod users;
