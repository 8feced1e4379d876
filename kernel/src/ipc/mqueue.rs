//! Message queues
//!
//! Named queues of opaque byte messages. Creating an existing name
//! returns the existing id and counts another user. Send blocks while
//! the queue is full, receive while it is empty; each wakes one peer
//! on success. The last user destroying the queue frees it, but only
//! once it has drained.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;
use crate::sync::WaitQueue;

#[derive(Debug)]
pub struct MessageQueue {
    /// Owned by the queue from creation to final destroy.
    name: String,
    id: u32,
    /// Capacity in messages.
    maxmsg: usize,
    users: u32,
    messages: VecDeque<Vec<u8>>,
    rd_queue: WaitQueue,
    wr_queue: WaitQueue,
}

impl MessageQueue {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.messages.len()
    }

    pub fn users(&self) -> u32 {
        self.users
    }
}

/// All live message queues. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct MqRegistry {
    queues: Vec<MessageQueue>,
    next_id: u32,
    /// Upper bound on one message payload.
    max_message_size: usize,
}

impl MqRegistry {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            queues: Vec::new(),
            next_id: 1,
            max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn by_id(&mut self, id: u32) -> KernelResult<usize> {
        self.queues
            .iter()
            .position(|q| q.id == id)
            .ok_or(KernelError::NotFound)
    }

    /// Create a queue, or join an existing one of the same name.
    pub fn create(&mut self, name: &str, capacity: usize, exec: &mut Exec) -> KernelResult<u32> {
        let iflag = exec.ints.begin_atomic();
        let id = if let Some(queue) = self.queues.iter_mut().find(|q| q.name == name) {
            queue.users += 1;
            queue.id
        } else {
            if capacity == 0 {
                exec.ints.end_atomic(iflag);
                return Err(KernelError::Invalid);
            }
            let id = self.next_id;
            self.next_id += 1;
            log::debug!("mq: created '{}' id={} capacity={}", name, id, capacity);
            self.queues.push(MessageQueue {
                name: name.to_string(),
                id,
                maxmsg: capacity,
                users: 1,
                messages: VecDeque::new(),
                rd_queue: WaitQueue::new(),
                wr_queue: WaitQueue::new(),
            });
            id
        };
        exec.ints.end_atomic(iflag);
        Ok(id)
    }

    /// Drop one user. The last user frees the queue, unless messages
    /// are still queued.
    pub fn destroy(&mut self, id: u32, exec: &mut Exec) -> KernelResult<()> {
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let at = self.by_id(id)?;
            let queue = &mut self.queues[at];
            queue.users -= 1;
            if queue.users > 0 {
                return Ok(());
            }
            if !queue.messages.is_empty() {
                // put the reference back; the queue must drain first
                queue.users += 1;
                return Err(KernelError::Busy);
            }
            log::debug!("mq: destroyed '{}' id={}", queue.name, id);
            self.queues.remove(at);
            Ok(())
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// Enqueue a message, blocking while the queue is full.
    pub fn send(&mut self, id: u32, payload: &[u8], exec: &mut Exec) -> KernelResult<()> {
        if payload.len() > self.max_message_size {
            return Err(KernelError::Invalid);
        }
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let at = self.by_id(id)?;
            let queue = &mut self.queues[at];
            if queue.messages.len() >= queue.maxmsg {
                return Err(exec.block_on(&mut queue.wr_queue));
            }
            queue.messages.push_back(payload.to_vec());
            exec.wake_one(&mut queue.rd_queue);
            Ok(())
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// Dequeue the oldest message, blocking while the queue is empty.
    pub fn receive(&mut self, id: u32, exec: &mut Exec) -> KernelResult<Vec<u8>> {
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let at = self.by_id(id)?;
            let queue = &mut self.queues[at];
            let payload = match queue.messages.pop_front() {
                Some(payload) => payload,
                None => return Err(exec.block_on(&mut queue.rd_queue)),
            };
            exec.wake_one(&mut queue.wr_queue);
            Ok(payload)
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// Diagnostic dump, one line per queue.
    pub fn info(&self) -> String {
        let mut out = String::new();
        for q in &self.queues {
            out.push_str(&format!(
                "Message Queue: {}  id={}, maxmsg={}, curmsgs={}, users={}\n",
                q.name,
                q.id,
                q.maxmsg,
                q.messages.len(),
                q.users
            ));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
