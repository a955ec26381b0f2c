//! Shapes shared by the trainer sync engine: the rows the backend stores, the denormalized
//! entities the app renders, and the pure transformers between the two.

pub mod client;
pub mod routine;
pub mod rows;
pub mod transform;

pub use client::{Client, ClientOrigin, ClientStatus};
pub use routine::{Block, BlockExercise, Routine, RoutineId, TemporaryIds};
pub use transform::{UNKNOWN_CLIENT_NAME, build_roster, build_routines};
