//! Service layer
//!
//! Local actions on top of the data layer. Anything that must reach a
//! remote server is recorded as a delivery request for the queue
//! processors.

mod account;
mod reaction;
mod relationship;
mod status;

pub use account::AccountService;
pub use reaction::ReactionService;
pub use relationship::RelationshipService;
pub use status::StatusService;
