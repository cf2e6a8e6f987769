//! Hooks that see every relayed exchange, on both the plain and the tunnel path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{Level, debug, enabled, info};

use crate::exchange::{Header, ObservedResponse, RelayExchange};

const MASKED_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie", "set-cookie"];

/// Outcome of [`TrafficInspector::inspect_request`].
#[derive(Debug)]
pub enum Verdict {
    /// Send the (possibly rewritten) exchange upstream.
    Forward(RelayExchange),
    /// Answer the client directly without contacting the origin.
    Respond(ObservedResponse),
}

pub trait TrafficInspector: Send + Sync {
    fn inspect_request(&self, exchange: RelayExchange) -> Verdict {
        Verdict::Forward(exchange)
    }

    /// Called once the response body has been fully delivered to the client.
    /// Runs on the response pump task and must not block.
    fn on_exchange_observed(&self, exchange: &RelayExchange, response: &ObservedResponse);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInspector;

impl TrafficInspector for NoopInspector {
    fn on_exchange_observed(&self, _exchange: &RelayExchange, _response: &ObservedResponse) {}
}

/// Logs a summary line per exchange and, at debug level, the full event as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInspector;

impl TrafficInspector for LoggingInspector {
    fn on_exchange_observed(&self, exchange: &RelayExchange, response: &ObservedResponse) {
        info!(
            id = %exchange.id,
            method = %exchange.method,
            url = %exchange.url(),
            status = response.status,
            req_bytes = exchange.body.len(),
            resp_bytes = response.body.len(),
            truncated = response.truncated,
            "exchange"
        );
        if !enabled!(Level::DEBUG) {
            return;
        }
        let mut req_evt = exchange.to_event();
        req_evt.headers = mask_sensitive(&req_evt.headers);
        let mut resp_evt = response.to_event(&exchange.id);
        resp_evt.headers = mask_sensitive(&resp_evt.headers);
        match (serde_json::to_string(&req_evt), serde_json::to_string(&resp_evt)) {
            (Ok(req), Ok(resp)) => debug!(id = %exchange.id, request = %req, response = %resp, "exchange detail"),
            (Err(e), _) | (_, Err(e)) => debug!(id = %exchange.id, "failed to serialize exchange: {}", e),
        }
    }
}

/// Copies `headers`, replacing credential-bearing values with `***`.
pub fn mask_sensitive(headers: &[Header]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| {
            if MASKED_HEADERS.iter().any(|m| h.name.eq_ignore_ascii_case(m)) {
                Header::new(h.name.clone(), "***")
            } else {
                h.clone()
            }
        })
        .collect()
}

/// Runs several inspectors in order. The first `Respond` verdict wins.
#[derive(Default, Clone)]
pub struct InspectorChain {
    inspectors: Vec<Arc<dyn TrafficInspector>>,
}

impl InspectorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, inspector: Arc<dyn TrafficInspector>) -> Self {
        self.inspectors.push(inspector);
        self
    }

    pub fn len(&self) -> usize {
        self.inspectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }
}

impl TrafficInspector for InspectorChain {
    fn inspect_request(&self, exchange: RelayExchange) -> Verdict {
        let mut current = exchange;
        for inspector in &self.inspectors {
            match inspector.inspect_request(current) {
                Verdict::Forward(next) => current = next,
                respond @ Verdict::Respond(_) => return respond,
            }
        }
        Verdict::Forward(current)
    }

    fn on_exchange_observed(&self, exchange: &RelayExchange, response: &ObservedResponse) {
        for inspector in &self.inspectors {
            inspector.on_exchange_observed(exchange, response);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedFlow {
    pub exchange: RelayExchange,
    pub response: ObservedResponse,
}

impl RecordedFlow {
    pub fn request_display(&self) -> String {
        self.exchange.request_display()
    }

    pub fn response_display(&self) -> String {
        self.response.display()
    }
}

/// Keeps the most recent completed flows, addressable by exchange id.
pub struct FlowRecorder {
    capacity: usize,
    flows: DashMap<String, Arc<RecordedFlow>>,
    order: Mutex<VecDeque<String>>,
}

impl FlowRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            flows: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<RecordedFlow>> {
        self.flows.get(id).map(|f| Arc::clone(f.value()))
    }

    /// Recorded ids, oldest first.
    pub fn ids(&self) -> Vec<String> {
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn record(&self, flow: RecordedFlow) {
        if self.capacity == 0 {
            return;
        }
        let id = flow.exchange.id.clone();
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        if self.flows.insert(id.clone(), Arc::new(flow)).is_none() {
            order.push_back(id);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.flows.remove(&oldest);
            }
        }
    }
}

impl TrafficInspector for FlowRecorder {
    fn on_exchange_observed(&self, exchange: &RelayExchange, response: &ObservedResponse) {
        self.record(RecordedFlow {
            exchange: exchange.clone(),
            response: response.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Scheme, gen_id, now_rfc3339};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exchange(path: &str) -> RelayExchange {
        RelayExchange {
            id: gen_id(),
            timestamp: now_rfc3339(),
            peer: None,
            method: "GET".into(),
            path: path.into(),
            version: "1.1".into(),
            headers: vec![
                Header::new("Host", "example.test"),
                Header::new("Authorization", "Bearer secret"),
            ],
            body: Bytes::new(),
            target_host: "example.test".into(),
            target_port: 80,
            scheme: Scheme::Http,
        }
    }

    #[test]
    fn masks_credentials_only() {
        let masked = mask_sensitive(&[
            Header::new("Authorization", "Bearer secret"),
            Header::new("Set-Cookie", "sid=1"),
            Header::new("Accept", "*/*"),
        ]);
        assert_eq!(masked[0].value, "***");
        assert_eq!(masked[1].value, "***");
        assert_eq!(masked[2].value, "*/*");
    }

    struct Tagger;
    impl TrafficInspector for Tagger {
        fn inspect_request(&self, mut exchange: RelayExchange) -> Verdict {
            exchange.set_header("X-Inspected", "1");
            Verdict::Forward(exchange)
        }
        fn on_exchange_observed(&self, _: &RelayExchange, _: &ObservedResponse) {}
    }

    struct Blocker;
    impl TrafficInspector for Blocker {
        fn inspect_request(&self, _exchange: RelayExchange) -> Verdict {
            Verdict::Respond(ObservedResponse::text(403, "blocked"))
        }
        fn on_exchange_observed(&self, _: &RelayExchange, _: &ObservedResponse) {}
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);
    impl TrafficInspector for Counter {
        fn on_exchange_observed(&self, _: &RelayExchange, _: &ObservedResponse) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn chain_rewrites_then_short_circuits() {
        let chain = InspectorChain::new().with(Arc::new(Tagger));
        match chain.inspect_request(exchange("/")) {
            Verdict::Forward(ex) => assert_eq!(ex.header("x-inspected"), Some("1")),
            Verdict::Respond(_) => panic!("expected forward"),
        }

        let chain = chain.with(Arc::new(Blocker));
        match chain.inspect_request(exchange("/")) {
            Verdict::Respond(resp) => assert_eq!(resp.status, 403),
            Verdict::Forward(_) => panic!("expected respond"),
        }
    }

    #[test]
    fn chain_fans_out_observations() {
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let chain = InspectorChain::new().with(a.clone()).with(b.clone());
        assert_eq!(chain.len(), 2);
        chain.on_exchange_observed(&exchange("/"), &ObservedResponse::text(200, "ok"));
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recorder_evicts_oldest() {
        let recorder = FlowRecorder::new(2);
        let flows: Vec<_> = (0..3).map(|i| exchange(&format!("/{i}"))).collect();
        for ex in &flows {
            recorder.on_exchange_observed(ex, &ObservedResponse::text(200, "ok"));
        }
        assert_eq!(recorder.len(), 2);
        assert!(recorder.get(&flows[0].id).is_none());
        assert_eq!(recorder.ids(), vec![flows[1].id.clone(), flows[2].id.clone()]);

        let flow = recorder.get(&flows[2].id).expect("recorded");
        assert!(flow.request_display().starts_with("GET /2 HTTP/1.1\r\n"));
        assert!(flow.response_display().ends_with("--- BODY ---\nok"));
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let recorder = FlowRecorder::new(0);
        recorder.on_exchange_observed(&exchange("/"), &ObservedResponse::text(200, "ok"));
        assert!(recorder.is_empty());
    }
}
