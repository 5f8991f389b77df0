//! Per-compilation context: configuration, target, and the counters that
//! keep generated names unique. There is no global state; every pass takes
//! the session explicitly.

use std::cell::Cell;

use mosaic_core::prelude::*;

#[derive(Debug)]
pub struct Session {
    pub config: GlobalConfig,
    pub target: TargetDescriptor,
    unique: Cell<u64>,
}

impl Session {
    pub fn new(config: GlobalConfig, target: TargetDescriptor) -> Self {
        Self {
            config,
            target,
            unique: Cell::new(0),
        }
    }

    /// A fresh name with a session-unique suffix.
    pub fn unique_name(&self, prefix: &str) -> String {
        let n = self.unique.get();
        self.unique.set(n + 1);
        format!("{prefix}_{n}")
    }
}
