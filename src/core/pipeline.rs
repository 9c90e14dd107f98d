use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::guard::{
    BlockedScriptRequest, BlockedScriptResponse, CspViolationRequest, CspViolationResponse,
    GuardService, SessionReportRequest, SessionReportResponse, SriValidationRequest,
    SriValidationResponse,
};
use crate::sri::DigestFetcher;

/// Inbound events from browser agents and scheduled tasks. Transport
/// adapters construct these and receive the reply on the oneshot channel.
#[derive(Debug)]
pub enum GuardEvent {
    SessionReport {
        request: SessionReportRequest,
        reply: oneshot::Sender<SessionReportResponse>,
    },
    SriValidation {
        request: SriValidationRequest,
        reply: oneshot::Sender<SriValidationResponse>,
    },
    BlockedScript {
        request: BlockedScriptRequest,
        reply: oneshot::Sender<BlockedScriptResponse>,
    },
    CspViolation {
        request: CspViolationRequest,
        reply: oneshot::Sender<CspViolationResponse>,
    },
}

/// Run the pipeline: receive guard events, dispatch to the service, reply.
/// Each event is handled independently; a dropped reply receiver is not an
/// error (the caller may have timed out).
pub async fn run_pipeline<F: DigestFetcher>(
    mut rx: mpsc::UnboundedReceiver<GuardEvent>,
    service: Arc<GuardService<F>>,
) {
    let mut event_count: u64 = 0;

    info!("Pipeline started, waiting for monitoring events...");

    while let Some(event) = rx.recv().await {
        match event {
            GuardEvent::SessionReport { request, reply } => {
                let response = service.report_observed_scripts(request).await;
                if reply.send(response).is_err() {
                    debug!("Session report reply receiver dropped");
                }
            }
            GuardEvent::SriValidation { request, reply } => {
                let response = service.validate_with_integrity(request).await;
                if reply.send(response).is_err() {
                    debug!("SRI validation reply receiver dropped");
                }
            }
            GuardEvent::BlockedScript { request, reply } => {
                let response = service.report_blocked_script(request).await;
                if reply.send(response).is_err() {
                    debug!("Blocked script reply receiver dropped");
                }
            }
            GuardEvent::CspViolation { request, reply } => {
                let response = service.report_csp_violation(request).await;
                if reply.send(response).is_err() {
                    debug!("CSP violation reply receiver dropped");
                }
            }
        }

        event_count += 1;
        if event_count % 1000 == 0 {
            info!("Pipeline processed {event_count} events");
        }
    }

    info!("Pipeline shutting down after {event_count} events");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::config::Config;
    use crate::db::tests::open_temp_db;
    use crate::notify::NullNotifier;
    use crate::sri::DigestAlgorithm;

    struct NoFetcher;

    impl DigestFetcher for NoFetcher {
        async fn fetch_digest(&self, _url: &str, _algorithm: DigestAlgorithm) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn pipeline_dispatches_and_replies() {
        let db = open_temp_db();
        let mut config = Config::default();
        config
            .monitoring
            .store_urls
            .insert("1".to_string(), "https://mystore.com".to_string());
        let service = Arc::new(GuardService::new(
            Arc::new(config),
            db,
            Arc::new(NoFetcher),
            Arc::new(NullNotifier),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(run_pipeline(rx, service));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(GuardEvent::SessionReport {
            request: SessionReportRequest {
                store_id: 1,
                page_url: "https://mystore.com/checkout".to_string(),
                scripts: vec!["/js/app.js".to_string()],
                check_type: "real-time".to_string(),
                session_id: None,
                user_agent: None,
                headers: BTreeMap::new(),
            },
            reply: reply_tx,
        })
        .unwrap();

        let response = reply_rx.await.unwrap();
        assert!(response.success);
        assert_eq!(response.authorized_count, 1);
        assert_eq!(response.unauthorized_count, 0);

        // Closing the channel shuts the pipeline down
        drop(tx);
        pipeline.await.unwrap();
    }
}
