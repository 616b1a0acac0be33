//! Scenario: the provider answers 400 to an acknowledgement; the job must
//! land in the dead-letter with the permanent counter bumped, never retried.

use std::sync::Arc;

use gaia_delivery::{
    Delivery, DeliveryConfig, FailureClass, JobFile, MetricsFile, OutboundAction,
    METRIC_ATTEMPT_SUCCEEDED, METRIC_MOVED_PERMANENT,
};
use gaia_telegram::{TelegramApi, TelegramConfig};
use httpmock::prelude::*;

#[tokio::test]
async fn permanent_provider_failure_quarantines_the_job() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/bottest-token/answerCallbackQuery");
        then.status(400)
            .json_body(serde_json::json!({ "ok": false, "description": "query is too old" }));
    });

    let api = TelegramApi::new(TelegramConfig {
        api_base: server.base_url(),
        bot_token: "test-token".to_string(),
        retries: 1,
        base_backoff: std::time::Duration::from_millis(1),
        http_timeout: std::time::Duration::from_secs(5),
    })
    .expect("api");
    let failed = JobFile::new(tempdir.path().join("failed.json"));
    let dead = JobFile::new(tempdir.path().join("dead.json"));
    let metrics = MetricsFile::new(tempdir.path().join("metrics.json"));
    let delivery = Delivery::new(
        Arc::new(api),
        failed.clone(),
        dead.clone(),
        metrics.clone(),
        DeliveryConfig::default(),
    );

    delivery
        .dispatch(
            OutboundAction::AnswerCallback {
                callback_query_id: "cb-2".to_string(),
                text: None,
            },
            Some("cb-2"),
        )
        .await
        .expect("dispatch");

    // 4xx is permanent: exactly one provider call, no retry queue entry.
    assert_eq!(mock.hits(), 1);
    assert!(failed.load().expect("failed queue").is_empty());
    let quarantined = dead.load().expect("dead letter");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].source_id.as_deref(), Some("cb-2"));
    assert_eq!(quarantined[0].classification, Some(FailureClass::Permanent));
    assert!(quarantined[0].failed_at.is_some());
    assert_eq!(metrics.get(METRIC_MOVED_PERMANENT).expect("metric"), 1);
    assert_eq!(metrics.get(METRIC_ATTEMPT_SUCCEEDED).expect("metric"), 0);

    // A retry pass over an empty live queue touches nothing.
    let report = delivery.run_retry_pass().await.expect("retry pass");
    assert_eq!(report.sent, 0);
    assert_eq!(report.moved_permanent, 0);
    assert_eq!(mock.hits(), 1);
}
