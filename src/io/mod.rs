//! Completion handling for reads against buffer groups.

mod read_completion;
pub use read_completion::{complete_read, prepare_read, ReadCompletion, ReadTicket};
