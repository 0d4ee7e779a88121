// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Environment lookup abstraction.
//!
//! Bootstrap and the duration resolver read the process environment through the
//! [`Environment`] trait so tests can supply values without mutating global state.

use std::collections::HashMap;

/// Read-only view of environment variables.
pub trait Environment: Send + Sync {
    /// Look up `key`, returning `None` when it is not set.
    fn lookup(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl Environment for HashMap<&'static str, &'static str> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| (*value).to_string())
    }
}
