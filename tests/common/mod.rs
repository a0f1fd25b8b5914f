//! Shared helpers for wirekit integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use wirekit::config::HttpConfig;
use wirekit::{ApiManager, ApiManagerBuilder, DelayPolicy, ReqwestTransport, RetryConfig};

/// Retry policy that keeps tests fast
pub fn quick_retries(retries: u32) -> RetryConfig {
    RetryConfig::default()
        .with_retries(retries)
        .with_delay(DelayPolicy::Constant {
            delay: Duration::from_millis(5),
        })
}

/// Reqwest transport writing partial downloads under `temp_dir`
pub fn reqwest_transport(temp_dir: &std::path::Path) -> Arc<ReqwestTransport> {
    Arc::new(ReqwestTransport::new(&HttpConfig::default(), temp_dir).expect("reqwest client"))
}

/// Builder with logging, status validation and fast retries
#[allow(dead_code)]
pub fn standard_builder(transport: Arc<ReqwestTransport>) -> ApiManagerBuilder {
    ApiManager::builder(transport)
        .logging(true)
        .status_validation(true)
        .retry_config(quick_retries(3))
}

/// Page of users in the shape of a typical list endpoint
#[allow(dead_code)]
pub fn users_page(page: u32, count: usize) -> Value {
    let data: Vec<Value> = (1..=count)
        .map(|i| {
            json!({
                "id": (page as usize - 1) * count + i,
                "email": format!("user{i}@example.com"),
                "first_name": format!("First{i}"),
                "last_name": format!("Last{i}"),
            })
        })
        .collect();
    json!({
        "page": page,
        "per_page": count,
        "total": count * 2,
        "total_pages": 2,
        "data": data,
    })
}
