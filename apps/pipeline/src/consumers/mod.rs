pub mod application_manager;
pub mod career_docs;
