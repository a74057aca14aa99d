use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use crate::{ConvoflowError, Result};

/// Default time a caller waits for a conversation lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Exclusive access to the conversation a flow execution belongs to.
pub trait FlowExecutionLock: Send + Sync {
    /// Blocks until the lock is held by the calling thread or the timeout elapses.
    fn lock(&self) -> Result<()>;

    fn unlock(&self);
}

/// Releases a [`FlowExecutionLock`] when dropped.
pub struct LockGuard {
    lock: Arc<dyn FlowExecutionLock>,
}

impl LockGuard {
    pub fn acquire(lock: Arc<dyn FlowExecutionLock>) -> Result<Self> {
        lock.lock()?;
        Ok(Self {
            lock,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[derive(Debug, Default)]
struct Holder {
    owner: Option<ThreadId>,
    holds: u32,
}

/// Reentrant lock with a bounded wait, one per conversation.
#[derive(Debug)]
pub struct ConversationLock {
    conversation_id: String,
    holder: Mutex<Holder>,
    released: Condvar,
    timeout: Duration,
}

impl ConversationLock {
    pub fn new(
        conversation_id: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            holder: Mutex::new(Holder::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn lock(&self) -> Result<()> {
        let me = thread::current().id();
        let deadline = Instant::now() + self.timeout;
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match holder.owner {
                None => {
                    holder.owner = Some(me);
                    holder.holds = 1;
                    trace!("conversation '{}' locked", self.conversation_id);
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    holder.holds += 1;
                    return Ok(());
                }
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConvoflowError::LockTimeout {
                    conversation_id: self.conversation_id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            holder = self.released.wait_timeout(holder, deadline - now).unwrap_or_else(PoisonError::into_inner).0;
        }
    }

    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.owner != Some(me) {
            warn!("conversation '{}' unlocked by a thread that does not hold it", self.conversation_id);
            return;
        }
        holder.holds -= 1;
        if holder.holds == 0 {
            holder.owner = None;
            trace!("conversation '{}' unlocked", self.conversation_id);
            self.released.notify_all();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner).owner.is_some()
    }
}
