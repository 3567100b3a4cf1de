// Core models
pub mod match_model;
pub mod payment;
pub mod queue;
pub mod tap_event;
pub mod user;

// Re-export commonly used types
pub use match_model::*;
pub use payment::*;
pub use queue::*;
pub use tap_event::*;
pub use user::*;
