//! Before/after failover hooks.

use std::sync::Mutex;
use tracing::warn;

use crate::common::{Error, Result};

/// Called with the dead master's address before a replica is elected.
pub type BeforeFailoverHook = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Called with the dead master's and the new master's address.
pub type AfterFailoverHook = Box<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

/// Hook lists. Hooks run in registration order while the list lock is
/// held, so a hook must not register hooks or block.
#[derive(Default)]
pub struct Hooks {
    before: Mutex<Vec<BeforeFailoverHook>>,
    after: Mutex<Vec<AfterFailoverHook>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before(&self, hook: BeforeFailoverHook) {
        self.before.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    pub fn add_after(&self, hook: AfterFailoverHook) {
        self.after.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    /// Run before-failover hooks. Only `GiveUpFailover` stops the sequence.
    pub fn run_before(&self, down_master: &str) -> Result<()> {
        let hooks = self.before.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            match hook(down_master) {
                Ok(()) => {}
                Err(Error::GiveUpFailover) => return Err(Error::GiveUpFailover),
                Err(e) => warn!(master = %down_master, error = %e, "before failover hook failed"),
            }
        }
        Ok(())
    }

    /// Run after-failover hooks. Only `GiveUpFailover` stops the sequence.
    pub fn run_after(&self, down_master: &str, new_master: &str) -> Result<()> {
        let hooks = self.after.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            match hook(down_master, new_master) {
                Ok(()) => {}
                Err(Error::GiveUpFailover) => return Err(Error::GiveUpFailover),
                Err(e) => warn!(
                    master = %down_master,
                    new_master = %new_master,
                    error = %e,
                    "after failover hook failed"
                ),
            }
        }
        Ok(())
    }
}
