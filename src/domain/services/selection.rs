//! Upstream Selection Policy
//!
//! Orders the configured upstreams for one forwarding attempt.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How the candidate order is produced for each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Shuffle on every query
    #[default]
    Random,
    /// Rotate the starting upstream on every query
    RoundRobin,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "round_robin" | "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown policy: {}", other)),
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A policy plus the rotation state round-robin needs.
#[derive(Debug, Default)]
pub struct Selector {
    policy: SelectionPolicy,
    robin: AtomicUsize,
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            robin: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Produce the order in which `items` should be tried.
    pub fn order<T: Clone>(&self, items: &[T]) -> Vec<T> {
        match self.policy {
            SelectionPolicy::Random => {
                let mut out = items.to_vec();
                out.shuffle(&mut rand::thread_rng());
                out
            }
            SelectionPolicy::RoundRobin => {
                if items.is_empty() {
                    return Vec::new();
                }
                let start = self.robin.fetch_add(1, Ordering::Relaxed) % items.len();
                items[start..]
                    .iter()
                    .chain(items[..start].iter())
                    .cloned()
                    .collect()
            }
        }
    }

    /// Pick one item uniformly at random.
    pub fn pick_random<T: Clone>(items: &[T]) -> Option<T> {
        items.choose(&mut rand::thread_rng()).cloned()
    }
}
