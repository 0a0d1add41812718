//! Virtual host route table.
//!
//! Lookups are exact and case-sensitive. The active table is published through
//! an [`ArcSwap`], so a reload replaces it in one step and a connection that
//! already took a snapshot keeps routing against that snapshot.

use arc_swap::ArcSwap;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::config::ProxyConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    hostname: String,
    backend_host: String,
    backend_port: u16,
}

impl Route {
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        backend_host: impl Into<String>,
        backend_port: u16,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            backend_host: backend_host.into(),
            backend_port,
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn backend_host(&self) -> &str {
        &self.backend_host
    }

    #[must_use]
    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend_host, self.backend_port)
    }
}

#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    /// Builds a table; a later route for the same hostname replaces an earlier one.
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|route| (route.hostname.clone(), Arc::new(route)))
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config
                .servers
                .iter()
                .map(|(hostname, server)| Route::new(hostname, &server.host, server.port)),
        )
    }

    #[must_use]
    pub fn lookup(&self, hostname: &str) -> Option<Arc<Route>> {
        self.routes.get(hostname).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The route table currently in effect.
#[derive(Debug)]
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    #[must_use]
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Publishes `table` and returns the one it replaced.
    pub fn replace(&self, table: RouteTable) -> Arc<RouteTable> {
        self.current.swap(Arc::new(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> RouteTable {
        RouteTable::new([
            Route::new("a.test", "10.0.0.1", 1000),
            Route::new("b.test", "10.0.0.2", 2000),
        ])
    }

    #[test]
    fn looks_up_exact_hostnames() {
        let table = sample_table();
        let route = table.lookup("a.test").unwrap();

        assert_eq!(route.backend_host(), "10.0.0.1");
        assert_eq!(route.backend_port(), 1000);
        assert_eq!(route.to_string(), "10.0.0.1:1000");
    }

    #[test]
    fn matching_is_case_sensitive_and_literal() {
        let table = sample_table();

        assert!(table.lookup("A.TEST").is_none());
        assert!(table.lookup("a.test.").is_none());
        assert!(table.lookup("x.a.test").is_none());
        assert!(table.lookup("").is_none());
    }

    #[test]
    fn later_duplicates_win() {
        let table = RouteTable::new([
            Route::new("a.test", "10.0.0.1", 1000),
            Route::new("a.test", "10.0.0.9", 9000),
        ]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("a.test").unwrap().backend_port(), 9000);
    }

    #[test]
    fn builds_from_config() {
        let config = ProxyConfig::new("127.0.0.1", 25565)
            .with_server("a.test", "10.0.0.1", 1000)
            .with_server("b.test", "10.0.0.2", 2000);

        let table = RouteTable::from_config(&config);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("b.test").unwrap().hostname(), "b.test");
    }

    #[test]
    fn snapshots_survive_replacement() {
        let shared = SharedRouteTable::new(sample_table());
        let before = shared.snapshot();
        let held = before.lookup("a.test").unwrap();

        let replaced = shared.replace(RouteTable::new([Route::new("c.test", "10.0.0.3", 3000)]));

        assert!(Arc::ptr_eq(&before, &replaced));
        assert_eq!(held.backend_port(), 1000);
        assert!(before.lookup("a.test").is_some());

        let after = shared.snapshot();
        assert!(after.lookup("a.test").is_none());
        assert!(after.lookup("c.test").is_some());
    }

    #[test]
    fn empty_table_routes_nothing() {
        let shared = SharedRouteTable::new(RouteTable::default());
        assert!(shared.snapshot().is_empty());
        assert!(shared.snapshot().lookup("a.test").is_none());
    }
}
