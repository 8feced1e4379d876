//! Concurrency substrate: the interrupt-atomic discipline and thread
//! wait queues.

mod int_state;
mod wait_queue;

pub use int_state::IntState;
pub use wait_queue::WaitQueue;
