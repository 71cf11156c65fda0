//! Small support utilities.

pub mod rng;
