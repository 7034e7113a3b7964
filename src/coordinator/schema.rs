//! Schema-version probe: one request/response round with every live
//! member to see whether a schema change has propagated.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use super::Coordinator;

use crate::cluster::EndpointId;
use crate::messaging::{ReplicaReply, ReplicaRequest, ResponseSink, Verb};
use crate::utils::CoordError;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Sentinel version for hosts that did not answer within the timeout.
pub const UNREACHABLE: &str = "UNREACHABLE";

#[derive(Clone)]
struct SchemaSink {
    inner: Arc<SchemaSinkInner>,
}

struct SchemaSinkInner {
    expected: usize,
    versions: Mutex<HashMap<EndpointId, String>>,
    done: Notify,
}

impl SchemaSink {
    fn record(&self, from: EndpointId, version: String) {
        let mut versions = self.inner.versions.lock().unwrap();
        versions.insert(from, version);
        if versions.len() >= self.inner.expected {
            self.inner.done.notify_waiters();
        }
    }
}

impl ResponseSink for SchemaSink {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        if let ReplicaReply::SchemaVersion { version } = reply {
            self.record(from, version);
        }
    }

    fn on_failure(&self, _from: EndpointId) {
        // a host that fails to answer is reported as unreachable
    }
}

impl Coordinator {
    /// Asks every live member for its schema version. Hosts that do not
    /// respond within the request timeout are grouped under the
    /// `"UNREACHABLE"` sentinel; disagreement is assumed for them.
    pub async fn describe_schema_versions(
        &self,
    ) -> Result<HashMap<String, Vec<String>>, CoordError> {
        let ctx = &self.ctx;
        let live = ctx.liveness.live_members();

        let sink = SchemaSink {
            inner: Arc::new(SchemaSinkInner {
                expected: live.len(),
                versions: Mutex::new(HashMap::new()),
                done: Notify::new(),
            }),
        };

        let mut callbacks = Vec::new();
        for &endpoint in &live {
            if ctx.is_me(endpoint) {
                sink.record(endpoint, ctx.schema_version.clone());
            } else {
                let cb = ctx.callbacks.register(Arc::new(sink.clone()));
                callbacks.push(cb);
                ctx.messaging.send_rr(
                    ReplicaRequest::SchemaCheck,
                    endpoint,
                    cb,
                );
            }
        }

        // wait for everyone, bounded by the request timeout
        let deadline =
            Instant::now() + ctx.rpc_timeout(Verb::RequestResponse);
        loop {
            let mut notified = pin!(sink.inner.done.notified());
            notified.as_mut().enable();
            if sink.inner.versions.lock().unwrap().len() >= live.len() {
                break;
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        ctx.callbacks.deregister(&callbacks);

        let versions = sink.inner.versions.lock().unwrap();
        let mut results: HashMap<String, Vec<String>> = HashMap::new();
        let all_hosts = live
            .into_iter()
            .chain(ctx.liveness.unreachable_members());
        for host in all_hosts {
            let version = versions
                .get(&host)
                .cloned()
                .unwrap_or_else(|| UNREACHABLE.to_string());
            results.entry(version).or_default().push(host.to_string());
        }

        if let Some(unreachable) = results.get(UNREACHABLE) {
            pf_debug!(ctx.me;
                      "hosts not in agreement, no response from: {:?}",
                      unreachable);
        }
        if results.len() == 1 {
            pf_debug!(ctx.me; "schemas are in agreement");
        }
        Ok(results)
    }
}
