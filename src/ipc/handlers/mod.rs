pub mod analytics;
pub mod assignments;
pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod groups;
pub mod reports;
pub mod setup;
pub mod students;
