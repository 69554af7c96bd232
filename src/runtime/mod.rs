//! The engine side: registering an instance's rings and running its completion cycles.

mod driver;
pub use driver::{Driver, RegistrationPolicy};
