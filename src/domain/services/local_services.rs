//! Services running on this site.

use crate::domain::entities::{EdgeSite, ServiceTableUpdate};
use crate::domain::services::service_table::normalize_service;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Set of service names served by this site, replaced wholesale.
/// Names are kept normalized, blank ones dropped.
#[derive(Debug, Default)]
pub struct LocalServices {
    names: RwLock<HashSet<String>>,
}

impl LocalServices {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: RwLock::new(normalized(names)),
        }
    }

    /// Replace the whole set.
    pub fn overwrite<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fresh = normalized(names);
        *self.names.write() = fresh;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(&normalize_service(name))
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Sorted copy of the names.
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// The declaration this site pushes upstream.
    pub fn to_update(&self, me: EdgeSite) -> ServiceTableUpdate {
        ServiceTableUpdate::new(me, self.snapshot())
    }
}

fn normalized<I, S>(names: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(|name| normalize_service(&name.into()))
        .filter(|name| !name.is_empty())
        .collect()
}
