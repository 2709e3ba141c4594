use crate::model::{Request, Response};
use crate::store::{Interaction, Store};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Persists finished request/response pairs. Recording is best-effort:
/// a store failure is logged and never reaches the client.
pub struct Recorder {
    store: Arc<dyn Store>,
}

impl Recorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Recorder { store }
    }

    pub async fn record(&self, request: &Request, response: &Response) {
        let interaction = Interaction {
            zone: request.zone_fqdn().to_string(),
            fqdn: request.req_fqdn().to_string(),
            protocol: request.protocol().as_str().to_string(),
            clientip: request.remote_addr().to_string(),
            request: request.json(),
            response: response.json(),
            reqsummary: request.summary(),
            respsummary: response.summary(),
        };

        let started = Instant::now();
        match self.store.record_interaction(interaction).await {
            Ok(time) => {
                metrics::counter!("interactions_recorded_total").increment(1);
                debug!(
                    "recorded interaction at {} (db write {:.3}s)",
                    time,
                    started.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                metrics::counter!("interactions_dropped_total").increment(1);
                error!("unable to save interaction: {}", e);
            }
        }
    }
}
