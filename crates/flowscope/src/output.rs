use chrono::{DateTime, SecondsFormat, Utc};
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::model::span::SpanStatus;
use flowscope_core::query::{
    CollectorPhase, DependencyGraph, FlowPage, OperationList, OperationStats, StatusResponse,
};
use owo_colors::OwoColorize;

pub fn print_flows_human(v: &FlowPage) {
    for flow in &v.flows {
        println!(
            "{} {} op={} status={} duration={} nodes={} edges={} spans={}",
            ts(flow.start_time),
            flow.flow_id.cyan(),
            flow.operation_name,
            status_label(flow.status),
            ms(flow.duration_ns as f64),
            flow.node_count,
            flow.edge_count,
            flow.span_count
        );
    }
    println!(
        "-- {} flows (page {}, {} total) --",
        v.flows.len(),
        v.page,
        v.total
    );
}

pub fn print_flow_human(v: &FlowGraph) {
    println!(
        "FLOW {} op={} env={} status={} duration={} spans={} dropped={}",
        v.flow_id,
        v.operation_name,
        v.environment.as_deref().unwrap_or("-"),
        status_label(v.status),
        ms(v.duration_ns as f64),
        v.span_count,
        v.dropped_spans
    );
    println!("root={} start={}", v.root_node, ts(v.start_time));
    for node in &v.nodes {
        println!(
            "  node {} version={} requests={} errors={} p50={} p95={} p99={}",
            node.id,
            node.deployment_version,
            node.metrics.request_count,
            node.metrics.error_count,
            ms(node.metrics.p50_ns as f64),
            ms(node.metrics.p95_ns as f64),
            ms(node.metrics.p99_ns as f64)
        );
    }
    for edge in &v.edges {
        println!(
            "  edge {} -> {} calls={} errors={} avg={} p95={}",
            edge.from,
            edge.to,
            edge.metrics.call_count,
            edge.metrics.error_count,
            ms(edge.metrics.avg_latency_ns),
            ms(edge.metrics.p95_ns as f64)
        );
    }
    println!("-- {} nodes, {} edges --", v.nodes.len(), v.edges.len());
}

pub fn print_dependencies_human(v: &DependencyGraph) {
    for node in &v.nodes {
        println!(
            "node {} version={} requests={} errors={} p95={}",
            node.id,
            node.deployment_version,
            node.metrics.request_count,
            node.metrics.error_count,
            ms(node.metrics.p95_ns as f64)
        );
    }
    for edge in &v.edges {
        let rate = format!("{:.1}%", edge.metrics.error_rate * 100.0);
        let rate = if edge.metrics.error_count > 0 {
            rate.red().to_string()
        } else {
            rate
        };
        println!(
            "edge {} -> {} calls={} error_rate={} avg={} p99={}",
            edge.from,
            edge.to,
            edge.metrics.call_count,
            rate,
            ms(edge.metrics.avg_latency_ns),
            ms(edge.metrics.p99_ns as f64)
        );
    }
    println!(
        "-- {} nodes, {} edges from {} flows --",
        v.nodes.len(),
        v.edges.len(),
        v.flow_count
    );
}

pub fn print_operations_human(v: &OperationList) {
    for op in &v.operations {
        println!(
            "{} flows={} errors={} error_rate={:.1}% avg={}",
            op.operation_name.cyan(),
            op.flow_count,
            op.error_count,
            op.error_rate * 100.0,
            ms(op.avg_duration_ns)
        );
    }
    println!("-- {} operations --", v.operations.len());
}

pub fn print_operation_human(v: &OperationStats) {
    let s = &v.summary;
    println!(
        "OPERATION {} flows={} errors={} error_rate={:.1}%",
        s.operation_name,
        s.flow_count,
        s.error_count,
        s.error_rate * 100.0
    );
    println!(
        "duration avg={} p50={} p95={} p99={}",
        ms(s.avg_duration_ns),
        ms(v.p50_duration_ns as f64),
        ms(v.p95_duration_ns as f64),
        ms(v.p99_duration_ns as f64)
    );
    println!("first_seen={} last_seen={}", ts(v.first_seen), ts(v.last_seen));
    println!("services={}", v.services.join(","));
    println!("namespaces={}", v.namespaces.join(","));
}

pub fn print_status_human(v: &StatusResponse) {
    println!("flows={} capacity={}", v.store.flow_count, v.store.capacity);
    if let Some(oldest) = v.store.oldest_start {
        println!("oldest={}", ts(oldest));
    }
    if let Some(newest) = v.store.newest_start {
        println!("newest={}", ts(newest));
    }

    let Some(c) = &v.collector else {
        println!("collector=disabled");
        return;
    };
    let phase = match c.phase {
        CollectorPhase::Idle => "idle".green().to_string(),
        CollectorPhase::Collecting => "collecting".yellow().to_string(),
    };
    println!("collector={phase} backend={}", c.backend);
    println!(
        "ticks={} skipped={} failures={} consecutive_failures={} flows_ingested={}",
        c.ticks, c.skipped_ticks, c.failures, c.consecutive_failures, c.flows_ingested
    );
    if let Some(last) = c.last_success {
        println!("last_success={}", ts(last));
    }
    if let Some(err) = &c.last_error {
        let at = c.last_error_at.map(ts).unwrap_or_else(|| "-".to_string());
        println!("last_error={} at={at}", err.red());
    }
}

fn status_label(status: SpanStatus) -> String {
    match status {
        SpanStatus::Error => "error".red().to_string(),
        SpanStatus::Ok => "ok".green().to_string(),
        SpanStatus::Unset => "unset".to_string(),
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ms(nanos: f64) -> String {
    format!("{:.1}ms", nanos / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_milliseconds() {
        assert_eq!(ms(80_000_000.0), "80.0ms");
        assert_eq!(ms(1_240_000.0), "1.2ms");
        assert_eq!(ms(0.0), "0.0ms");
    }
}
