use std::collections::BTreeMap;
use std::future::Future;

use crate::config::Config;
use crate::core::CheckType;
use crate::guard::{GuardService, SessionReportRequest, SessionReportResponse};
use crate::sri::DigestFetcher;

/// What a page scan yields: the script inventory plus security headers.
#[derive(Debug, Clone, Default)]
pub struct PageScan {
    pub script_urls: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

/// Page-scanning collaborator for the scheduled/manual check path. HTML
/// retrieval and parsing live outside the engine; implementations return the
/// discovered script URLs and response headers for one page.
pub trait PageFetcher: Send + Sync {
    fn fetch_page(&self, url: &str)
    -> impl Future<Output = Result<PageScan, crate::core::GuardError>> + Send;
}

/// Scan one page via the fetcher and run a full monitoring pass over the
/// result. Fetch failures degrade to an unsuccessful response rather than an
/// error.
pub async fn run_page_check<P: PageFetcher, F: DigestFetcher>(
    service: &GuardService<F>,
    fetcher: &P,
    store_id: i64,
    page_url: &str,
    check_type: CheckType,
) -> SessionReportResponse {
    let scan = match fetcher.fetch_page(page_url).await {
        Ok(scan) => scan,
        Err(e) => {
            tracing::warn!("Page scan failed for {page_url}: {e}");
            return SessionReportResponse {
                success: false,
                log_id: None,
                authorized_count: 0,
                unauthorized_count: 0,
                unauthorized_scripts: Vec::new(),
                error: Some(format!("page scan failed: {e}")),
            };
        }
    };

    service
        .report_observed_scripts(SessionReportRequest {
            store_id,
            page_url: page_url.to_string(),
            scripts: scan.script_urls,
            check_type: check_type.tag(),
            session_id: None,
            user_agent: None,
            headers: scan.headers,
        })
        .await
}

/// Scan every monitored page of every configured store.
pub async fn run_scheduled_checks<P: PageFetcher, F: DigestFetcher>(
    service: &GuardService<F>,
    fetcher: &P,
    config: &Config,
) -> Vec<SessionReportResponse> {
    let mut responses = Vec::new();
    for store_id in config.store_ids() {
        let Some(origin) = config.store_url(store_id) else {
            continue;
        };
        let origin = origin.trim_end_matches('/').to_string();
        for page in &config.monitoring.monitored_pages {
            let page_url = format!("{origin}{page}");
            responses
                .push(run_page_check(service, fetcher, store_id, &page_url, CheckType::Scheduled).await);
        }
    }
    responses
}
