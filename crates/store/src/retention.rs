use std::time::Duration;

use chrono::{DateTime, Utc};
use flowscope_core::error::Result;
use flowscope_core::time::to_chrono;

use crate::FlowStore;
use crate::db::Inner;

impl FlowStore {
    /// Drops flows older than `ttl`, measured on flow start time.
    pub fn run_retention(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(ttl)?;
        Ok(self.prune_older_than(cutoff))
    }

    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.write();
        let expired = inner
            .by_age
            .iter()
            .take_while(|(start, _)| *start < cutoff)
            .map(|(_, id)| id.clone())
            .collect::<Vec<_>>();
        for id in &expired {
            inner.remove(id);
        }
        expired.len()
    }
}

impl Inner {
    pub(crate) fn evict_over_capacity(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.flows.len() > self.capacity {
            let Some((_, id)) = self.by_age.first().cloned() else {
                break;
            };
            self.remove(&id);
            evicted.push(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use testkit::{base_time, sample_flow};

    use crate::FlowStore;

    #[test]
    fn prune_drops_flows_started_before_cutoff() {
        let store = FlowStore::new(10);
        store.put(sample_flow("old", "login", 0, &[("gateway", "ns-a")]));
        store.put(sample_flow("edge", "login", 60, &[("gateway", "ns-a")]));
        store.put(sample_flow("new", "login", 120, &[("gateway", "ns-a")]));

        let removed = store.prune_older_than(base_time() + ChronoDuration::seconds(60));
        assert_eq!(removed, 1);
        assert!(!store.contains("old"));
        assert!(store.contains("edge"));
        assert!(store.contains("new"));
    }

    #[test]
    fn ttl_prunes_old_flows() {
        let store = FlowStore::new(10);
        store.put(sample_flow("t1", "login", 0, &[("gateway", "ns-a")]));

        let removed = store.run_retention(Duration::from_secs(60)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }
}
