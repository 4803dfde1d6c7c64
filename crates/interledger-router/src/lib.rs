//! Longest-prefix-match routing table mapping ILP addresses to next-hop peer ids.

use parking_lot::RwLock;
use tracing::debug;

/// Peer id meaning "deliver to an in-process or locally-configured handler" rather than
/// forwarding over a BTP connection.
pub const LOCAL_PEER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: String,
    pub next_hop: String,
    pub priority: i32,
}

/// Single-writer, many-reader routing table. Reads happen once per forwarded packet; writes
/// are admin-driven and rare, so a read-mostly lock is sufficient (spec's concurrency model).
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<Vec<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Adds or replaces the route for `prefix`.
    pub fn add_route(&self, prefix: impl Into<String>, next_hop: impl Into<String>, priority: i32) {
        let prefix = prefix.into();
        let next_hop = next_hop.into();
        debug!(%prefix, %next_hop, priority, "adding route");
        let mut routes = self.routes.write();
        if let Some(existing) = routes.iter_mut().find(|r| r.prefix == prefix) {
            existing.next_hop = next_hop;
            existing.priority = priority;
        } else {
            routes.push(RouteEntry {
                prefix,
                next_hop,
                priority,
            });
        }
    }

    pub fn remove_route(&self, prefix: &str) {
        debug!(%prefix, "removing route");
        self.routes.write().retain(|r| r.prefix != prefix);
    }

    pub fn get_all_routes(&self) -> Vec<RouteEntry> {
        self.routes.read().clone()
    }

    /// Returns the next-hop peer id for `destination`, or `None` if no route matches.
    ///
    /// Matches on raw string prefix (per spec: "the implementation matches on raw
    /// string prefix"), highest `priority` wins, ties broken by longest prefix, further
    /// ties broken by insertion order (the first-inserted matching route wins).
    pub fn get_next_hop(&self, destination: &str) -> Option<String> {
        let routes = self.routes.read();
        let mut best: Option<&RouteEntry> = None;
        for route in routes.iter() {
            if !destination.starts_with(route.prefix.as_str()) {
                continue;
            }
            best = match best {
                None => Some(route),
                Some(current) => {
                    if route.priority > current.priority
                        || (route.priority == current.priority
                            && route.prefix.len() > current.prefix.len())
                    {
                        Some(route)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(|r| r.next_hop.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_route_returns_none() {
        let table = RoutingTable::new();
        assert_eq!(table.get_next_hop("g.alice"), None);
    }

    #[test]
    fn longest_prefix_wins_on_equal_priority() {
        let table = RoutingTable::new();
        table.add_route("g", "peerA", 0);
        table.add_route("g.alice", "peerB", 0);
        assert_eq!(table.get_next_hop("g.alice.wallet"), Some("peerB".into()));
        assert_eq!(table.get_next_hop("g.bob"), Some("peerA".into()));
    }

    #[test]
    fn higher_priority_wins_over_longer_prefix() {
        let table = RoutingTable::new();
        table.add_route("g.alice", "longer", 0);
        table.add_route("g", "higher-priority", 10);
        assert_eq!(table.get_next_hop("g.alice.wallet"), Some("higher-priority".into()));
    }

    #[test]
    fn remove_route_stops_matching() {
        let table = RoutingTable::new();
        table.add_route("g.alice", "peerA", 0);
        table.remove_route("g.alice");
        assert_eq!(table.get_next_hop("g.alice.wallet"), None);
    }

    #[test]
    fn add_route_replaces_existing_prefix() {
        let table = RoutingTable::new();
        table.add_route("g.alice", "peerA", 0);
        table.add_route("g.alice", "peerB", 5);
        let routes = table.get_all_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, "peerB");
        assert_eq!(routes[0].priority, 5);
    }

    #[test]
    fn local_delivery_prefix() {
        let table = RoutingTable::new();
        table.add_route("g.connector", LOCAL_PEER_ID, 0);
        assert_eq!(
            table.get_next_hop("g.connector.accounts.alice"),
            Some(LOCAL_PEER_ID.to_string())
        );
    }
}
