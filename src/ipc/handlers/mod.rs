pub mod attendance;
pub mod behavior;
pub mod core;
pub mod courses;
pub mod fees;
pub mod grades;
pub mod stats;
pub mod users;
