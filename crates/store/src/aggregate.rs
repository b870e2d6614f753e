use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use flowscope_core::filter::GroupBy;
use flowscope_core::model::flow::{EdgeMetrics, FlowEdge, FlowGraph, FlowNode, NodeKey, NodeMetrics};
use flowscope_core::model::span::UNKNOWN;
use flowscope_core::query::{DependencyGraph, DependencyRequest};
use flowscope_core::stats::{LatencySummary, ratio};

use crate::FlowStore;

/// Pod placeholder when nodes are grouped per service.
pub const ANY_POD: &str = "*";

impl FlowStore {
    pub fn dependency_graph(&self, req: &DependencyRequest) -> DependencyGraph {
        aggregate(&self.snapshot(), req)
    }
}

#[derive(Default)]
struct NodeAcc {
    request_count: u64,
    error_count: u64,
    total_latency_ns: u64,
    latencies_ns: Vec<u64>,
    versions: BTreeSet<String>,
}

#[derive(Default)]
struct EdgeAcc {
    call_count: u64,
    error_count: u64,
    total_latency_ns: f64,
    latencies_ns: Vec<u64>,
}

/// Folds `flows` into one dependency graph. Flows not matching the request's
/// filter are skipped, so any subset of the store can be passed in.
pub fn aggregate(flows: &[Arc<FlowGraph>], req: &DependencyRequest) -> DependencyGraph {
    let mut nodes: BTreeMap<NodeKey, NodeAcc> = BTreeMap::new();
    let mut edges: BTreeMap<(NodeKey, NodeKey), EdgeAcc> = BTreeMap::new();
    let mut flow_count = 0;

    for flow in flows.iter().filter(|f| req.filter.matches(f)) {
        flow_count += 1;
        let mut keys: HashMap<&str, NodeKey> = HashMap::new();

        for node in &flow.nodes {
            let key = group_key(node, req.group_by);
            let acc = nodes.entry(key.clone()).or_default();
            acc.request_count += node.metrics.request_count;
            acc.error_count += node.metrics.error_count;
            acc.total_latency_ns += node.metrics.total_latency_ns;
            acc.latencies_ns.extend_from_slice(&node.latencies_ns);
            if node.deployment_version != UNKNOWN {
                acc.versions.extend(
                    node.deployment_version
                        .split(',')
                        .filter(|v| !v.is_empty())
                        .map(str::to_string),
                );
            }
            keys.insert(node.id.as_str(), key);
        }

        for edge in &flow.edges {
            let (Some(from), Some(to)) = (keys.get(edge.from.as_str()), keys.get(edge.to.as_str()))
            else {
                continue;
            };
            let acc = edges.entry((from.clone(), to.clone())).or_default();
            acc.call_count += edge.metrics.call_count;
            acc.error_count += edge.metrics.error_count;
            acc.total_latency_ns += edge.metrics.avg_latency_ns * edge.metrics.call_count as f64;
            acc.latencies_ns.extend_from_slice(&edge.latencies_ns);
        }
    }

    if let Some(namespace) = &req.filter.namespace {
        restrict_to_namespace(&mut nodes, &mut edges, namespace);
    }

    let mut nodes = nodes
        .into_iter()
        .map(|(key, acc)| finish_node(key, acc))
        .collect::<Vec<_>>();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let mut edges = edges
        .into_iter()
        .map(|((from, to), acc)| finish_edge(&from, &to, acc))
        .collect::<Vec<_>>();
    edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

    DependencyGraph {
        flow_count,
        nodes,
        edges,
    }
}

fn group_key(node: &FlowNode, group_by: GroupBy) -> NodeKey {
    let mut key = node.key();
    if group_by == GroupBy::Service {
        key.pod_name = ANY_POD.to_string();
    }
    key
}

/// Keeps nodes in `namespace`, edges with at least one endpoint there, and
/// the far endpoints of those edges.
fn restrict_to_namespace(
    nodes: &mut BTreeMap<NodeKey, NodeAcc>,
    edges: &mut BTreeMap<(NodeKey, NodeKey), EdgeAcc>,
    namespace: &str,
) {
    edges.retain(|(from, to), _| from.namespace == namespace || to.namespace == namespace);
    let endpoints = edges
        .keys()
        .flat_map(|(from, to)| [from.clone(), to.clone()])
        .collect::<BTreeSet<_>>();
    nodes.retain(|key, _| key.namespace == namespace || endpoints.contains(key));
}

fn finish_node(key: NodeKey, mut acc: NodeAcc) -> FlowNode {
    let latency = LatencySummary::from_samples(&mut acc.latencies_ns);
    let deployment_version = if acc.versions.is_empty() {
        UNKNOWN.to_string()
    } else {
        acc.versions.into_iter().collect::<Vec<_>>().join(",")
    };
    FlowNode {
        id: key.id(),
        service_name: key.service_name,
        namespace: key.namespace,
        pod_name: key.pod_name,
        deployment_version,
        metrics: NodeMetrics {
            request_count: acc.request_count,
            error_count: acc.error_count,
            total_latency_ns: acc.total_latency_ns,
            p50_ns: latency.p50_ns,
            p95_ns: latency.p95_ns,
            p99_ns: latency.p99_ns,
            max_ns: latency.max_ns,
        },
        latencies_ns: acc.latencies_ns,
    }
}

fn finish_edge(from: &NodeKey, to: &NodeKey, mut acc: EdgeAcc) -> FlowEdge {
    let latency = LatencySummary::from_samples(&mut acc.latencies_ns);
    let avg_latency_ns = if acc.call_count == 0 {
        0.0
    } else {
        acc.total_latency_ns / acc.call_count as f64
    };
    FlowEdge {
        from: from.id(),
        to: to.id(),
        metrics: EdgeMetrics {
            call_count: acc.call_count,
            error_count: acc.error_count,
            error_rate: ratio(acc.error_count, acc.call_count),
            avg_latency_ns,
            p50_ns: latency.p50_ns,
            p95_ns: latency.p95_ns,
            p99_ns: latency.p99_ns,
            max_ns: latency.max_ns,
        },
        latencies_ns: acc.latencies_ns,
    }
}

#[cfg(test)]
mod tests {
    use flowscope_core::filter::FlowFilter;
    use testkit::sample_flow;

    use super::*;

    fn flows() -> Vec<Arc<FlowGraph>> {
        vec![
            Arc::new(sample_flow("f1", "login", 0, &[("gateway", "ns-a"), ("auth", "ns-b")])),
            Arc::new(sample_flow(
                "f2",
                "login",
                10,
                &[("gateway", "ns-a"), ("auth", "ns-b"), ("users", "ns-c")],
            )),
            Arc::new(sample_flow("f3", "search", 20, &[("gateway", "ns-a"), ("search", "ns-d")])),
        ]
    }

    fn node<'a>(graph: &'a DependencyGraph, id: &str) -> &'a FlowNode {
        graph.nodes.iter().find(|n| n.id == id).unwrap()
    }

    #[test]
    fn merges_nodes_and_edges_across_flows() {
        let graph = aggregate(&flows(), &DependencyRequest::default());
        assert_eq!(graph.flow_count, 3);
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 3);

        let gateway = node(&graph, "ns-a/gateway/gateway-0");
        assert_eq!(gateway.metrics.request_count, 3);
        assert_eq!(gateway.metrics.max_ns, 30_000_000);
        assert!(gateway.metrics.p50_ns <= gateway.metrics.p95_ns);
        assert!(gateway.metrics.p95_ns <= gateway.metrics.p99_ns);
        assert_eq!(gateway.deployment_version, "1.0.0");

        let login_edge = graph
            .edges
            .iter()
            .find(|e| e.to == "ns-b/auth/auth-0")
            .unwrap();
        assert_eq!(login_edge.metrics.call_count, 2);
        assert_eq!(login_edge.metrics.avg_latency_ns, 15_000_000.0);
        assert_eq!(login_edge.metrics.max_ns, 20_000_000);
    }

    #[test]
    fn output_is_sorted_and_deterministic() {
        let mut reversed = flows();
        reversed.reverse();
        let a = aggregate(&flows(), &DependencyRequest::default());
        let b = aggregate(&reversed, &DependencyRequest::default());
        assert_eq!(a, b);

        let ids = a.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn namespace_keeps_edges_touching_it() {
        let req = DependencyRequest {
            filter: FlowFilter {
                namespace: Some("ns-b".to_string()),
                ..FlowFilter::default()
            },
            ..DependencyRequest::default()
        };
        let graph = aggregate(&flows(), &req);

        assert_eq!(graph.flow_count, 2);
        let ids = graph.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec!["ns-a/gateway/gateway-0", "ns-b/auth/auth-0", "ns-c/users/users-0"]
        );
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.nodes.iter().all(|n| n.namespace != "ns-d"));
    }

    #[test]
    fn group_by_service_collapses_pods() {
        let mut other_pod = sample_flow("f4", "login", 30, &[("gateway", "ns-a"), ("auth", "ns-b")]);
        for n in &mut other_pod.nodes {
            n.pod_name = format!("{}-1", n.service_name);
            n.id = n.key().id();
            n.deployment_version = "1.1.0".to_string();
        }
        for e in &mut other_pod.edges {
            e.from = e.from.replace("-0", "-1");
            e.to = e.to.replace("-0", "-1");
        }
        let mut all = flows();
        all.push(Arc::new(other_pod));

        let by_pod = aggregate(&all, &DependencyRequest::default());
        assert_eq!(by_pod.nodes.len(), 6);

        let by_service = aggregate(
            &all,
            &DependencyRequest {
                group_by: GroupBy::Service,
                ..DependencyRequest::default()
            },
        );
        assert_eq!(by_service.nodes.len(), 4);
        let auth = node(&by_service, "ns-b/auth/*");
        assert_eq!(auth.metrics.request_count, 3);
        assert_eq!(auth.deployment_version, "1.0.0,1.1.0");
    }

    #[test]
    fn store_dependency_graph_uses_filter() {
        let store = FlowStore::new(10);
        for flow in flows() {
            store.put(flow.as_ref().clone());
        }
        let graph = store.dependency_graph(&DependencyRequest {
            filter: FlowFilter {
                operation: Some("search".to_string()),
                ..FlowFilter::default()
            },
            ..DependencyRequest::default()
        });
        assert_eq!(graph.flow_count, 1);
        assert_eq!(graph.edges.len(), 1);
    }
}
