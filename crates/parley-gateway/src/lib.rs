pub mod dispatcher;

pub use dispatcher::{Dispatcher, Frame, JoinOutcome};
