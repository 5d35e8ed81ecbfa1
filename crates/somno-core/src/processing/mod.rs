//! Background reduction of closed windows

mod queue;
mod worker;

pub use queue::*;
pub use worker::*;
