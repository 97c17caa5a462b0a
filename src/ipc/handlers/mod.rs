pub mod announcements;
pub mod auth;
pub mod backup;
pub mod classes;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod polls;
pub mod roster;
