//! Hierarchical, cooperatively cancellable progress goals
//!
//! Every refresh attempt owns one root [`Goal`]. Long-running suppliers open
//! nested goals for their stages, which is also how they observe cancellation:
//! opening a child of a cancelled goal fails, and [`Goal::tick`] can be polled
//! at any checkpoint. Cancellation propagates to all registered children.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::error::{LarderError, LarderResult};

/// One node in the progress tree of a refresh attempt
#[derive(Debug)]
pub struct Goal {
    id: Uuid,
    name: String,
    stage: Mutex<Option<String>>,
    cancelled: AtomicBool,
    children: Mutex<Vec<Arc<Goal>>>,
}

impl Goal {
    /// Create a root goal
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            stage: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Unique identity of this goal, used in logs and the snapshot race guard
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Goal name as given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the current stage label
    pub fn stage(&self, label: impl Into<String>) {
        *lock_ok(&self.stage) = Some(label.into());
    }

    /// Clear the current stage label
    pub fn stage_off(&self) {
        *lock_ok(&self.stage) = None;
    }

    /// Current stage label, if one is set
    pub fn current_stage(&self) -> Option<String> {
        lock_ok(&self.stage).clone()
    }

    /// Whether this goal has been cancelled
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this goal and all currently registered children
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            for child in lock_ok(&self.children).iter() {
                child.cancel();
            }
        }
    }

    /// Cancellation checkpoint
    pub fn tick(&self) -> LarderResult<()> {
        if self.cancelled() {
            Err(LarderError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Open a child goal. Fails immediately when this goal is cancelled.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> LarderResult<Arc<Goal>> {
        let mut children = lock_ok(&self.children);
        // Checked under the children lock so a concurrent cancel() either sees
        // the new child or we see the cancellation.
        if self.cancelled() {
            return Err(LarderError::Cancelled);
        }
        let child = Goal::new(name);
        children.push(Arc::clone(&child));
        Ok(child)
    }

    /// Remove a finished child. Safe to call during cleanup of a cancelled goal.
    pub fn remove_child(&self, child: &Arc<Goal>) {
        lock_ok(&self.children).retain(|c| !Arc::ptr_eq(c, child));
    }

    /// Snapshot of currently registered children
    pub fn children(&self) -> Vec<Arc<Goal>> {
        lock_ok(&self.children).clone()
    }

    /// One-line rendering of the goal subtree, e.g. `refresh / supplier [a, b]`
    pub fn format(&self) -> String {
        let mut text = self.name.clone();
        if let Some(stage) = self.current_stage() {
            text.push_str(" / ");
            text.push_str(&stage);
        }
        let children: Vec<String> = self.children().iter().map(|c| c.format()).collect();
        match children.len() {
            0 => {}
            1 => {
                text.push_str(" / ");
                text.push_str(&children[0]);
            }
            _ => {
                text.push_str(" [");
                text.push_str(&children.join(", "));
                text.push(']');
            }
        }
        text
    }
}

fn lock_ok<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
