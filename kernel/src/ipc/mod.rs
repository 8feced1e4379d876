//! Inter-process communication: named message queues and counting
//! semaphores. (Pipes live with the filesystem layer, since their
//! endpoints are files.)

mod mqueue;
mod semaphore;

pub use mqueue::{MessageQueue, MqRegistry};
pub use semaphore::{SemaphoreTable, MAX_SEM_NAME};
