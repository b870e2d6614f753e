use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::query::StoreStats;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted { evicted: Vec<String> },
    /// A flow with this id was already stored; the new graph was discarded.
    Duplicate,
}

impl PutOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// In-memory flow cache. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct FlowStore {
    inner: Arc<RwLock<Inner>>,
}

pub(crate) struct Inner {
    pub(crate) capacity: usize,
    pub(crate) flows: HashMap<String, Arc<FlowGraph>>,
    pub(crate) by_age: BTreeSet<(DateTime<Utc>, String)>,
    pub(crate) by_operation: HashMap<String, BTreeSet<String>>,
    pub(crate) by_namespace: HashMap<String, BTreeSet<String>>,
}

impl FlowStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                capacity: capacity.max(1),
                flows: HashMap::new(),
                by_age: BTreeSet::new(),
                by_operation: HashMap::new(),
                by_namespace: HashMap::new(),
            })),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("store lock poisoned")
    }

    /// First write wins: a flow id that is already present is left untouched.
    pub fn put(&self, flow: FlowGraph) -> PutOutcome {
        let mut inner = self.write();
        if inner.flows.contains_key(&flow.flow_id) {
            return PutOutcome::Duplicate;
        }
        inner.insert(Arc::new(flow));
        let evicted = inner.evict_over_capacity();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted flows over capacity");
        }
        PutOutcome::Inserted { evicted }
    }

    pub fn get(&self, flow_id: &str) -> Option<Arc<FlowGraph>> {
        self.read().flows.get(flow_id).cloned()
    }

    pub fn contains(&self, flow_id: &str) -> bool {
        self.read().flows.contains_key(flow_id)
    }

    pub fn len(&self) -> usize {
        self.read().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored flow, most recent first. The graphs are shared, so the
    /// snapshot stays valid after the lock is released.
    pub fn snapshot(&self) -> Vec<Arc<FlowGraph>> {
        let mut flows = self.read().flows.values().cloned().collect::<Vec<_>>();
        flows.sort_by(|a, b| recency_order(a, b));
        flows
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        StoreStats {
            flow_count: inner.flows.len(),
            capacity: inner.capacity,
            oldest_start: inner.by_age.first().map(|(ts, _)| *ts),
            newest_start: inner.by_age.last().map(|(ts, _)| *ts),
        }
    }
}

impl Inner {
    fn insert(&mut self, flow: Arc<FlowGraph>) {
        let id = flow.flow_id.clone();
        self.by_age.insert((flow.start_time, id.clone()));
        self.by_operation
            .entry(flow.operation_name.clone())
            .or_default()
            .insert(id.clone());
        for namespace in flow.namespaces() {
            self.by_namespace
                .entry(namespace.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.flows.insert(id, flow);
    }

    pub(crate) fn remove(&mut self, flow_id: &str) -> Option<Arc<FlowGraph>> {
        let flow = self.flows.remove(flow_id)?;
        self.by_age.remove(&(flow.start_time, flow.flow_id.clone()));
        remove_from_index(&mut self.by_operation, &flow.operation_name, flow_id);
        for namespace in flow.namespaces() {
            remove_from_index(&mut self.by_namespace, namespace, flow_id);
        }
        Some(flow)
    }
}

fn remove_from_index(index: &mut HashMap<String, BTreeSet<String>>, key: &str, flow_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(flow_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Most recent start first, flow id ascending among equal starts.
pub(crate) fn recency_order(a: &FlowGraph, b: &FlowGraph) -> Ordering {
    b.start_time
        .cmp(&a.start_time)
        .then_with(|| a.flow_id.cmp(&b.flow_id))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use testkit::sample_flow;

    use super::*;

    #[test]
    fn put_is_first_write_wins() {
        let store = FlowStore::new(10);
        let first = sample_flow("t1", "login", 0, &[("gateway", "ns-a"), ("auth", "ns-b")]);
        let mut second = first.clone();
        second.operation_name = "logout".to_string();

        assert!(store.put(first).is_inserted());
        assert_eq!(store.put(second), PutOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("t1").unwrap().operation_name, "login");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn capacity_evicts_oldest_start_first() {
        let store = FlowStore::new(2);
        store.put(sample_flow("late", "op", 30, &[("a", "ns")]));
        store.put(sample_flow("early", "op", 10, &[("a", "ns")]));
        let outcome = store.put(sample_flow("middle", "op", 20, &[("a", "ns")]));

        assert_eq!(
            outcome,
            PutOutcome::Inserted {
                evicted: vec!["early".to_string()]
            }
        );
        assert!(!store.contains("early"));
        assert_eq!(store.len(), 2);

        // An insert older than everything else is evicted right away.
        let outcome = store.put(sample_flow("ancient", "op", 0, &[("a", "ns")]));
        assert_eq!(
            outcome,
            PutOutcome::Inserted {
                evicted: vec!["ancient".to_string()]
            }
        );
    }

    #[test]
    fn eviction_cleans_secondary_indices() {
        let store = FlowStore::new(1);
        store.put(sample_flow("t1", "login", 0, &[("gateway", "ns-a")]));
        store.put(sample_flow("t2", "search", 5, &[("search", "ns-c")]));

        let inner = store.read();
        assert!(!inner.by_operation.contains_key("login"));
        assert!(!inner.by_namespace.contains_key("ns-a"));
        assert_eq!(inner.by_age.len(), 1);
    }

    #[test]
    fn snapshot_orders_by_recency_then_id() {
        let store = FlowStore::new(10);
        store.put(sample_flow("b", "op", 10, &[("a", "ns")]));
        store.put(sample_flow("a", "op", 10, &[("a", "ns")]));
        store.put(sample_flow("c", "op", 20, &[("a", "ns")]));

        let ids = store
            .snapshot()
            .iter()
            .map(|f| f.flow_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let stats = store.stats();
        assert_eq!(stats.flow_count, 3);
        assert!(stats.oldest_start < stats.newest_start);
    }

    #[test]
    fn concurrent_puts_of_same_trace_store_one_flow() {
        let store = FlowStore::new(100);
        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    store.put(sample_flow("shared", "login", 0, &[("gateway", "ns-a")]))
                })
            })
            .collect::<Vec<_>>();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(PutOutcome::is_inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }
}
