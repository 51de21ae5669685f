//! Service Table
//!
//! Concurrent mapping from service name to the set of sites serving it.
//! A single readers-writer lock guards the whole map: lookups share it,
//! updates hold it exclusively for the full add-and-prune pass.

use crate::domain::entities::{EdgeSite, EdgeSiteSet, ServiceTableUpdate};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Canonical form of a service name: lowercased, without a trailing dot.
/// Table keys, local names and query names all go through this.
pub fn normalize_service(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Point-in-time copy of the table, ordered by service name.
pub type TableSnapshot = BTreeMap<String, EdgeSiteSet>;

/// service name -> sites currently serving it.
///
/// A name is present iff its set is non-empty.
#[derive(Debug, Default)]
pub struct ServiceTable {
    entries: RwLock<HashMap<String, EdgeSiteSet>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sites serving `service`, or `None` if nobody does.
    ///
    /// Returns a copy so no lock outlives the call.
    pub fn lookup(&self, service: &str) -> Option<EdgeSiteSet> {
        self.entries.read().get(&normalize_service(service)).cloned()
    }

    /// Replace everything `origin` serves with `services`.
    ///
    /// `origin` is added to every named service and removed from every
    /// other one; entries left empty are deleted. An empty `services`
    /// withdraws the site entirely. Names are normalized first; blank
    /// names are ignored.
    pub fn update(&self, origin: EdgeSite, services: &[String]) {
        let declared: HashSet<String> = services
            .iter()
            .map(|name| normalize_service(name))
            .filter(|name| !name.is_empty())
            .collect();

        let mut entries = self.entries.write();

        for name in &declared {
            entries.entry(name.clone()).or_default().add(origin);
        }

        let mut emptied = Vec::new();
        for (name, sites) in entries.iter_mut() {
            if declared.contains(name) {
                continue;
            }
            if sites.remove(&origin) && sites.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in &emptied {
            entries.remove(name);
        }

        tracing::info!(
            "service table updated origin={} services={} pruned={} entries={}",
            origin,
            declared.len(),
            emptied.len(),
            entries.len()
        );
    }

    /// Apply a decoded push update.
    pub fn apply(&self, update: &ServiceTableUpdate) {
        self.update(update.origin, &update.services);
    }

    /// Number of service names with at least one site.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> TableSnapshot {
        self.entries
            .read()
            .iter()
            .map(|(name, sites)| (name.clone(), sites.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Point;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn site(last_octet: u8) -> EdgeSite {
        EdgeSite::new(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, last_octet)),
            Point::new(f64::from(last_octet), 0.0),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lookup_missing() {
        let table = ServiceTable::new();
        assert!(table.lookup("echo").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_adds_site() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["echo", "checkout"]));

        assert!(table.lookup("echo").unwrap().contains(&site(1)));
        assert!(table.lookup("checkout").unwrap().contains(&site(1)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_update_is_idempotent() {
        let once = ServiceTable::new();
        once.update(site(1), &names(&["a", "b"]));

        let twice = ServiceTable::new();
        twice.update(site(1), &names(&["a", "b"]));
        twice.update(site(1), &names(&["a", "b"]));

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_update_prunes_stale_services() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["a", "b"]));
        table.update(site(1), &names(&["a"]));

        assert!(table.lookup("b").is_none());
        assert!(table.lookup("a").unwrap().contains(&site(1)));
    }

    #[test]
    fn test_empty_declaration_withdraws_site() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["a", "b"]));
        table.update(site(1), &[]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_leaves_other_sites_alone() {
        let table = ServiceTable::new();
        table.update(site(2), &names(&["a", "b"]));
        table.update(site(1), &names(&["a"]));
        table.update(site(1), &names(&["c"]));

        let a = table.lookup("a").unwrap();
        assert!(a.contains(&site(2)));
        assert!(!a.contains(&site(1)));
        assert!(table.lookup("b").unwrap().contains(&site(2)));
        assert_eq!(table.lookup("c").unwrap().len(), 1);
    }

    #[test]
    fn test_shared_entry_survives_one_withdrawal() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["a"]));
        table.update(site(2), &names(&["a"]));
        table.update(site(1), &[]);

        let a = table.lookup("a").unwrap();
        assert_eq!(a.len(), 1);
        assert!(a.contains(&site(2)));
    }

    #[test]
    fn test_duplicate_names_in_declaration() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["a", "a"]));
        assert_eq!(table.lookup("a").unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_returns_detached_copy() {
        let table = ServiceTable::new();
        table.update(site(1), &names(&["a"]));
        let mut copy = table.lookup("a").unwrap();
        copy.add(site(9));
        assert_eq!(table.lookup("a").unwrap().len(), 1);
    }

    #[test]
    fn test_names_are_normalized() {
        assert_eq!(normalize_service("Echo."), "echo");
        assert_eq!(normalize_service(" web "), "web");

        let table = ServiceTable::new();
        table.update(site(1), &names(&["Echo", "web.", "  "]));
        assert_eq!(table.len(), 2);
        assert!(table.lookup("echo").unwrap().contains(&site(1)));
        assert!(table.lookup("ECHO.").is_some());
        assert!(table.lookup("web").is_some());

        // A redeclaration in another case is the same service.
        table.update(site(1), &names(&["ECHO"]));
        assert!(table.lookup("web").is_none());
        assert_eq!(table.lookup("echo").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_push_update() {
        let table = ServiceTable::new();
        table.apply(&ServiceTableUpdate::new(site(3), names(&["echo"])));
        assert!(table.lookup("echo").unwrap().contains(&site(3)));
    }

    #[test]
    fn test_concurrent_updates_from_many_sites() {
        let table = Arc::new(ServiceTable::new());
        let handles: Vec<_> = (1..=8u8)
            .map(|n| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        table.update(site(n), &names(&["shared", "other"]));
                        table.update(site(n), &names(&["shared"]));
                        let _ = table.lookup("shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.lookup("shared").unwrap().len(), 8);
        assert!(table.lookup("other").is_none());
    }
}
