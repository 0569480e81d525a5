//! Job-result propagation to downstream entities

pub mod propagation;

pub use propagation::{propagation_for, EntityUpdate};
