use tracing::trace;

// Trace-based counters; the Prometheus endpoint only exposes what the recorder sees.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catalog.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn batch_committed(seller: &str, writes: usize, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        seller = seller,
        writes = writes as u64,
        elapsed_ms = elapsed_ms as u64,
        "batch_committed_inc"
    );
}

pub fn scan_recorded(seller: &str, found: usize, new: usize, updated: usize, deactivated: usize) {
    trace!(
        target = "catalog.metrics",
        seller = seller,
        found = found as u64,
        new = new as u64,
        updated = updated as u64,
        deactivated = deactivated as u64,
        "scan_recorded"
    );
}

pub fn run_finished(status: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        status = status,
        elapsed_ms = elapsed_ms as u64,
        "runs_total_inc"
    );
}
