//! Queue name to backend resolution.

use std::collections::HashMap;

use qg_common::{BackendKind, RoutePolicy, WILDCARD_ROUTE};

use crate::{QueueError, Result};

/// Backend used when a non-empty table has neither an exact nor a wildcard
/// entry for a queue.
pub const DEFAULT_BACKEND: BackendKind = BackendKind::Redis;

/// Immutable routing table. Resolution order: exact queue name, then `*`, then
/// [`DEFAULT_BACKEND`]. An empty table routes nowhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<String, RoutePolicy>,
}

impl RoutingTable {
    pub fn new(routes: HashMap<String, RoutePolicy>) -> Self {
        Self { routes }
    }

    /// Route every queue with one policy.
    pub fn uniform(policy: RoutePolicy) -> Self {
        Self::new(HashMap::from([(WILDCARD_ROUTE.to_string(), policy)]))
    }

    /// Backends for `queue_name`, in resolution order. Empty only when the
    /// table itself is empty.
    pub fn resolve(&self, queue_name: &str) -> &'static [BackendKind] {
        if self.routes.is_empty() {
            return &[];
        }
        self.routes
            .get(queue_name)
            .or_else(|| self.routes.get(WILDCARD_ROUTE))
            .copied()
            .unwrap_or_else(|| RoutePolicy::from(DEFAULT_BACKEND))
            .backends()
    }

    /// Like [`resolve`](Self::resolve), but an empty resolution is an error.
    pub fn backends_for(&self, queue_name: &str) -> Result<&'static [BackendKind]> {
        match self.resolve(queue_name) {
            [] => Err(QueueError::NoBackendForQueue(queue_name.to_string())),
            backends => Ok(backends),
        }
    }

    /// Backends referenced by any entry.
    pub fn referenced_backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = Vec::new();
        for policy in self.routes.values() {
            for kind in policy.backends() {
                if !kinds.contains(kind) {
                    kinds.push(*kind);
                }
            }
        }
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::uniform(RoutePolicy::from(DEFAULT_BACKEND))
    }
}

impl<K: Into<String>> FromIterator<(K, RoutePolicy)> for RoutingTable {
    fn from_iter<I: IntoIterator<Item = (K, RoutePolicy)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BackendKind::{Amqp, Redis};

    #[test]
    fn test_exact_match_wins_over_wildcard() {
        let table: RoutingTable = [("orders", RoutePolicy::Redis), ("*", RoutePolicy::Amqp)]
            .into_iter()
            .collect();

        assert_eq!(table.resolve("orders"), &[Redis]);
        assert_eq!(table.resolve("invoices"), &[Amqp]);
    }

    #[test]
    fn test_both_resolves_redis_then_amqp() {
        let table = RoutingTable::uniform(RoutePolicy::Both);
        assert_eq!(table.resolve("anything"), &[Redis, Amqp]);
    }

    #[test]
    fn test_missing_wildcard_uses_default_backend() {
        let table: RoutingTable = [("orders", RoutePolicy::Amqp)].into_iter().collect();
        assert_eq!(table.resolve("orders"), &[Amqp]);
        assert_eq!(table.resolve("invoices"), &[DEFAULT_BACKEND]);
    }

    #[test]
    fn test_empty_table_resolves_to_nothing() {
        let table = RoutingTable::new(HashMap::new());
        assert!(table.resolve("orders").is_empty());
        assert!(matches!(
            table.backends_for("orders"),
            Err(QueueError::NoBackendForQueue(q)) if q == "orders"
        ));
    }

    #[test]
    fn test_resolution_is_deterministic_and_total() {
        let tables = [
            RoutingTable::default(),
            RoutingTable::uniform(RoutePolicy::Both),
            [("orders", RoutePolicy::Both)].into_iter().collect::<RoutingTable>(),
            [("a", RoutePolicy::Amqp), ("*", RoutePolicy::Redis)]
                .into_iter()
                .collect::<RoutingTable>(),
        ];
        let queues = ["", "orders", "a", "*", "notifications", "ÜNICODE-queue"];

        for table in &tables {
            for queue in queues {
                let first = table.resolve(queue);
                assert!(!first.is_empty(), "{:?} resolved {} to nothing", table, queue);
                assert_eq!(first, table.resolve(queue));
            }
        }
    }

    #[test]
    fn test_referenced_backends() {
        let table: RoutingTable = [("orders", RoutePolicy::Both), ("*", RoutePolicy::Redis)]
            .into_iter()
            .collect();
        let mut kinds = table.referenced_backends();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(kinds, vec![Amqp, Redis]);
    }
}
