pub mod allocation;
pub mod attendance;
pub mod auth;
pub mod core;
pub mod dashboard;
pub mod departments;
pub mod exams;
pub mod halls;
pub mod invigilation;
pub mod seating;
pub mod setup;
pub mod students;
pub mod teachers;
