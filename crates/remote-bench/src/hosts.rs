use std::collections::BTreeMap;

/// Hosts available for benchmarking, grouped by region.
///
/// Regions iterate in name order so selection is reproducible.
pub type Fleet = BTreeMap<String, Vec<String>>;

/// Source of the hosts in the testbed.
pub trait InstanceManager: Send + Sync {
    fn hosts(&self) -> Fleet;
}

/// A fleet fixed in the settings file.
#[derive(Debug, Clone, Default)]
pub struct StaticFleet {
    fleet: Fleet,
}

impl StaticFleet {
    pub fn new(fleet: Fleet) -> Self {
        Self { fleet }
    }

    /// A fleet without region information, kept as one region.
    pub fn single_region(region: impl Into<String>, hosts: Vec<String>) -> Self {
        let mut fleet = Fleet::new();
        fleet.insert(region.into(), hosts);
        Self { fleet }
    }
}

impl InstanceManager for StaticFleet {
    fn hosts(&self) -> Fleet {
        self.fleet.clone()
    }
}

/// Every host in the fleet, region by region.
pub fn all_hosts(fleet: &Fleet) -> Vec<String> {
    fleet.values().flatten().cloned().collect()
}

/// Pick `required` hosts spread across regions.
///
/// Hosts are taken round-robin over the regions (first host of every region,
/// then the second, and so on) before truncating, so small clusters still span
/// as many regions as possible. Returns an empty selection when the fleet is too
/// small.
pub fn select(fleet: &Fleet, required: usize) -> Vec<String> {
    let capacity = fleet.values().map(Vec::len).sum::<usize>();
    if capacity < required {
        return Vec::new();
    }

    let depth = fleet.values().map(Vec::len).max().unwrap_or(0);
    let mut ordered = Vec::with_capacity(capacity);
    for i in 0..depth {
        for hosts in fleet.values() {
            if let Some(host) = hosts.get(i) {
                if !ordered.contains(host) {
                    ordered.push(host.clone());
                }
            }
        }
    }
    if ordered.len() < required {
        return Vec::new();
    }
    ordered.truncate(required);
    ordered
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fleet(regions: &[(&str, &[&str])]) -> Fleet {
        regions
            .iter()
            .map(|(r, hosts)| {
                (
                    r.to_string(),
                    hosts.iter().map(|h| h.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn interleaves_regions_before_truncating() {
        let fleet = fleet(&[("eu", &["e1", "e2"]), ("us", &["u1", "u2"])]);
        assert_eq!(select(&fleet, 3), vec!["e1", "u1", "e2"]);
        assert_eq!(select(&fleet, 4), vec!["e1", "u1", "e2", "u2"]);
    }

    #[test]
    fn uneven_regions_still_fill_the_request() {
        let fleet = fleet(&[("a", &["a1", "a2", "a3"]), ("b", &["b1"])]);
        assert_eq!(select(&fleet, 4), vec!["a1", "b1", "a2", "a3"]);
    }

    #[test]
    fn insufficient_capacity_is_empty() {
        let fleet = fleet(&[("a", &["a1"]), ("b", &["b1"])]);
        assert!(select(&fleet, 3).is_empty());
        assert!(select(&Fleet::new(), 1).is_empty());
    }

    #[test]
    fn hosts_are_never_repeated() {
        let fleet = fleet(&[("a", &["x", "y"]), ("b", &["x", "z"])]);
        assert_eq!(select(&fleet, 3), vec!["x", "y", "z"]);
        assert!(select(&fleet, 4).is_empty());
    }

    #[test]
    fn zero_required_is_empty() {
        let fleet = fleet(&[("a", &["a1"])]);
        assert!(select(&fleet, 0).is_empty());
    }

    #[test]
    fn single_region_fleet() {
        let manager = StaticFleet::single_region("teleport", vec!["h1".into(), "h2".into()]);
        assert_eq!(all_hosts(&manager.hosts()), vec!["h1", "h2"]);
        assert_eq!(select(&manager.hosts(), 2), vec!["h1", "h2"]);
    }
}
