//! Environment snapshot
//!
//! Resolution never reads `std::env` directly. The process environment is
//! captured once into an [`Environment`] so that a provider activation sees a
//! consistent view and tests can build one from literal pairs.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a variable. Empty values are reported as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// First non-empty variable among `names`, with its position.
    pub fn first_of<'a>(&'a self, names: &[&'static str]) -> Option<(usize, &'static str, &'a str)> {
        names
            .iter()
            .enumerate()
            .find_map(|(idx, name)| self.get(name).map(|value| (idx, *name, value)))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }
}
