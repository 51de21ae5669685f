//! Domain Entities - Core business objects
//!
//! These entities represent the sites of the deployment and the services
//! they announce. They have no I/O and contain only business logic.

use crate::domain::services::geo::distance_km;
use crate::domain::value_objects::Point;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// A deployment site able to serve traffic.
///
/// Equality is by address and location together: the same address
/// announced from a different place is a different site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSite {
    /// Public address answered to clients
    #[serde(rename = "ip")]
    pub address: IpAddr,
    /// Where the site is
    #[serde(rename = "coords")]
    pub location: Point,
}

impl EdgeSite {
    pub fn new(address: IpAddr, location: Point) -> Self {
        Self { address, location }
    }

    /// Distance from this site to `point`, in kilometers.
    pub fn distance_to(&self, point: &Point) -> f64 {
        distance_km(&self.location, point)
    }
}

impl std::fmt::Display for EdgeSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.location)
    }
}

/// The set of sites running one service.
///
/// Uniqueness is by value. The set carries no ordering, so which of
/// several equidistant sites [`EdgeSiteSet::closest_to`] picks is
/// unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeSiteSet {
    sites: HashSet<EdgeSite>,
}

impl EdgeSiteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a site; returns false if it was already present.
    pub fn add(&mut self, site: EdgeSite) -> bool {
        self.sites.insert(site)
    }

    /// Remove a site; returns true if it was present.
    pub fn remove(&mut self, site: &EdgeSite) -> bool {
        self.sites.remove(site)
    }

    pub fn contains(&self, site: &EdgeSite) -> bool {
        self.sites.contains(site)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EdgeSite> {
        self.sites.iter()
    }

    /// The member closest to `reference`, or `None` for an empty set.
    pub fn closest_to(&self, reference: &Point) -> Option<&EdgeSite> {
        closest_site(self.sites.iter(), reference)
    }

    /// Members as a plain list (order unspecified).
    pub fn to_vec(&self) -> Vec<EdgeSite> {
        self.sites.iter().copied().collect()
    }
}

impl FromIterator<EdgeSite> for EdgeSiteSet {
    fn from_iter<I: IntoIterator<Item = EdgeSite>>(iter: I) -> Self {
        Self {
            sites: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a EdgeSiteSet {
    type Item = &'a EdgeSite;
    type IntoIter = std::collections::hash_set::Iter<'a, EdgeSite>;

    fn into_iter(self) -> Self::IntoIter {
        self.sites.iter()
    }
}

/// Pick the site with the smallest great-circle distance to `reference`.
///
/// The first site seen among equal minima wins.
pub fn closest_site<'a, I>(sites: I, reference: &Point) -> Option<&'a EdgeSite>
where
    I: IntoIterator<Item = &'a EdgeSite>,
{
    let mut best: Option<(&EdgeSite, f64)> = None;

    for site in sites {
        let dist = site.distance_to(reference);
        match best {
            Some((_, best_dist)) if dist >= best_dist => {}
            _ => best = Some((site, dist)),
        }
    }

    best.map(|(site, _)| site)
}

/// A full declaration from one site of every service it currently runs.
///
/// Sites send this periodically to their upstreams; applying it replaces
/// whatever the origin declared before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTableUpdate {
    #[serde(rename = "meta")]
    pub origin: EdgeSite,
    #[serde(default)]
    pub services: Vec<String>,
}

impl ServiceTableUpdate {
    pub fn new(origin: EdgeSite, services: Vec<String>) -> Self {
        Self { origin, services }
    }
}
