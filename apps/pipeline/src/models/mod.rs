pub mod application;
pub mod messages;
