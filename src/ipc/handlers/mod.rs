pub mod announcements;
pub mod attendance;
pub mod auth;
pub mod branches;
pub mod core;
pub mod dashboard;
pub mod fees;
pub mod instructors;
pub mod inventory;
pub mod orders;
pub mod students;
