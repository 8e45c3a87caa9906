// State-transition validation for job and step lifecycle values.

pub mod validator;

pub use validator::{verify_state_transition, verify_status_transition};
