use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wrench_api::{app, AppState, Backends, DomainSettings};
use wrench_booking::StaticGateway;
use wrench_core::models::CustomerAccount;
use wrench_core::notify::LogNotifier;
use wrench_core::payment::CheckoutSession;
use wrench_store::InMemoryStore;

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    gateway: Arc<StaticGateway>,
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let gateway = Arc::new(StaticGateway::new());
    let backends = Backends {
        bookings: store.clone(),
        history: store.clone(),
        customers: store.clone(),
        referrals: store.clone(),
        guard: store.clone(),
        events: store.clone(),
        notifier: Arc::new(LogNotifier),
        gateway: gateway.clone(),
    };
    let state = AppState::build(backends, DomainSettings::default()).unwrap();
    TestApp { router: app(state), store, gateway }
}

fn paid_session(id: &str, email: &str) -> CheckoutSession {
    let metadata: HashMap<String, String> = [
        ("customerEmail", email),
        ("customerName", "Alice Smith"),
        ("vehicleMake", "Ford"),
        ("vehicleModel", "Fiesta"),
        ("vehicleRegistration", "AB12 CDE"),
        ("serviceLabel", "Oil Change"),
        ("servicePrice", "80.00"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    CheckoutSession {
        id: id.to_string(),
        payment_status: "paid".to_string(),
        amount_total: Some(8000),
        currency: Some("gbp".to_string()),
        metadata,
        ..Default::default()
    }
}

fn webhook(event_type: &str, session: &CheckoutSession) -> Value {
    json!({
        "id": "evt_1",
        "type": event_type,
        "data": { "object": session },
    })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

#[tokio::test]
async fn health_check() {
    let t = test_app();
    let (status, body) = send(&t.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn webhook_redelivery_returns_the_same_booking() {
    let t = test_app();
    let event = webhook("checkout.session.completed", &paid_session("cs_web_1", "alice@example.com"));

    let (status, first) = send(&t.router, "POST", "/v1/webhooks/payments", Some(event.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["success"], true);
    assert_eq!(first["isDuplicate"], false);

    let (status, second) = send(&t.router, "POST", "/v1/webhooks/payments", Some(event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["isDuplicate"], true);
    assert_eq!(second["bookingId"], first["bookingId"]);

    assert_eq!(t.store.booking_count(), 1);
    assert_eq!(t.store.history_count(), 1);
}

#[tokio::test]
async fn unhandled_webhook_events_are_acknowledged() {
    let t = test_app();
    let event = webhook("invoice.paid", &paid_session("cs_other", "alice@example.com"));

    let (status, body) = send(&t.router, "POST", "/v1/webhooks/payments", Some(event)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["bookingId"].is_null());
    assert_eq!(t.store.booking_count(), 0);
}

#[tokio::test]
async fn unpaid_webhook_session_is_ignored() {
    let t = test_app();
    let mut session = paid_session("cs_unpaid", "alice@example.com");
    session.payment_status = "unpaid".to_string();

    let (status, _) = send(
        &t.router,
        "POST",
        "/v1/webhooks/payments",
        Some(webhook("checkout.session.completed", &session)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.store.booking_count(), 0);
}

#[tokio::test]
async fn webhook_with_unusable_metadata_is_not_retried() {
    let t = test_app();
    let mut session = paid_session("cs_bad", "alice@example.com");
    session.metadata.remove("servicePrice");

    let (status, _) = send(
        &t.router,
        "POST",
        "/v1/webhooks/payments",
        Some(webhook("checkout.session.completed", &session)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.store.booking_count(), 0);
}

#[tokio::test]
async fn webhook_with_malformed_session_is_acknowledged() {
    let t = test_app();
    let mut event = webhook("checkout.session.completed", &paid_session("cs_malformed", "alice@example.com"));
    event["data"]["object"]["metadata"] = json!(5);

    let (status, body) = send(&t.router, "POST", "/v1/webhooks/payments", Some(event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "malformed session");
    assert!(body["bookingId"].is_null());
    assert_eq!(t.store.booking_count(), 0);
}

#[tokio::test]
async fn session_confirm_after_webhook_is_a_duplicate() {
    let t = test_app();
    let session = paid_session("cs_both", "alice@example.com");
    t.gateway.insert(session.clone());

    let (_, from_webhook) = send(
        &t.router,
        "POST",
        "/v1/webhooks/payments",
        Some(webhook("checkout.session.completed", &session)),
    )
    .await;

    let (status, confirmed) = send(
        &t.router,
        "POST",
        "/v1/checkout/confirm",
        Some(json!({ "sessionId": "cs_both" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["isDuplicate"], true);
    assert_eq!(confirmed["bookingId"], from_webhook["bookingId"]);

    let (status, booking) = send(&t.router, "GET", "/v1/bookings/session/cs_both", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(booking["totals"]["total"], 8000);
    assert_eq!(booking["source"], "webhook");
}

#[tokio::test]
async fn confirm_unknown_session_is_not_found() {
    let t = test_app();
    let (status, body) = send(
        &t.router,
        "POST",
        "/v1/checkout/confirm",
        Some(json!({ "sessionId": "cs_missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn confirm_requires_a_session_id() {
    let t = test_app();
    let (status, _) = send(&t.router, "POST", "/v1/checkout/confirm", Some(json!({ "sessionId": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn direct_create_rejects_a_basket_without_services() {
    let t = test_app();
    let body = json!({
        "customer": { "name": "Alice", "email": "alice@example.com" },
        "vehicle": { "registration": "AB12CDE" },
        "services": [],
    });

    let (status, response) = send(&t.router, "POST", "/v1/checkout/direct", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["success"], false);
    assert_eq!(t.store.booking_count(), 0);
}

#[tokio::test]
async fn booking_status_follows_the_lifecycle() {
    let t = test_app();
    let body = json!({
        "customer": { "name": "Alice", "email": "alice@example.com" },
        "vehicle": { "make": "Ford", "model": "Fiesta", "registration": "AB12 CDE" },
        "services": [{ "id": "svc-oil", "label": "Oil Change", "price": 80.0 }],
    });
    let (status, created) = send(&t.router, "POST", "/v1/checkout/direct", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let id = created["bookingId"].as_str().unwrap().to_string();

    let (status, booking) = send(
        &t.router,
        "POST",
        &format!("/v1/bookings/{}/status", id),
        Some(json!({ "status": "in-progress" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(booking["status"], "in-progress");

    let (status, _) = send(
        &t.router,
        "POST",
        &format!("/v1/bookings/{}/status", id),
        Some(json!({ "status": "pending" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, history) = send(&t.router, "GET", "/v1/history?email=Alice@Example.com", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["status"], "in-progress");
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let t = test_app();
    let uri = format!("/v1/bookings/{}", uuid::Uuid::new_v4());
    let (status, _) = send(&t.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn referral_signup_and_first_booking_pay_the_referrer() {
    let t = test_app();

    let (status, bob) = send(
        &t.router,
        "POST",
        "/v1/customers",
        Some(json!({ "email": "bob@example.com", "name": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let code = bob["account"]["referralCode"].as_str().unwrap().to_string();

    let (status, validation) = send(&t.router, "GET", &format!("/v1/referrals/validate/{}", code), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["referrerName"], "Bob");

    let (status, carol) = send(
        &t.router,
        "POST",
        "/v1/customers",
        Some(json!({ "email": "carol@example.com", "name": "Carol", "referralCode": code })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(carol["referralApplied"], true);

    let event = webhook("checkout.session.completed", &paid_session("cs_carol", "carol@example.com"));
    let (status, _) = send(&t.router, "POST", "/v1/webhooks/payments", Some(event.clone())).await;
    assert_eq!(status, StatusCode::OK);
    send(&t.router, "POST", "/v1/webhooks/payments", Some(event)).await;

    let (status, summary) = send(&t.router, "GET", "/v1/customers/bob@example.com/referrals", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["referralBalance"], 1000);
    assert_eq!(summary["totalEarnings"], 1000);
    assert_eq!(summary["referrals"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn referral_for_an_already_referred_customer_conflicts() {
    let t = test_app();
    let bob = CustomerAccount::new("bob@example.com".into(), "Bob".into(), None, "WRBOB123".into());
    t.store.seed_customer(bob);

    let body = json!({ "code": "WRBOB123", "referredEmail": "dan@example.com", "referredName": "Dan" });
    let (status, _) = send(&t.router, "POST", "/v1/referrals", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(&t.router, "POST", "/v1/referrals", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn upcoming_booking_shows_as_a_reminder() {
    let t = test_app();
    let date = (Utc::now().date_naive() + Duration::days(5)).format("%Y-%m-%d").to_string();
    let body = json!({
        "customer": { "name": "Alice", "email": "alice@example.com" },
        "vehicle": { "make": "Ford", "model": "Fiesta", "registration": "AB12 CDE" },
        "services": [{ "id": "svc-mot", "label": "MOT", "price": 54.85 }],
        "date": date,
    });
    let (status, _) = send(&t.router, "POST", "/v1/checkout/direct", Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, reminders) = send(&t.router, "GET", "/v1/customers/alice@example.com/reminders", None).await;
    assert_eq!(status, StatusCode::OK);
    let reminders = reminders.as_array().unwrap();
    assert!(reminders.iter().any(|r| r["kind"] == "scheduled" && r["daysUntil"] == 5 && r["priority"] == "medium"));
}

#[tokio::test]
async fn metrics_count_reconciliations_by_outcome() {
    let t = test_app();
    let event = webhook("checkout.session.completed", &paid_session("cs_metrics", "alice@example.com"));
    send(&t.router, "POST", "/v1/webhooks/payments", Some(event.clone())).await;
    send(&t.router, "POST", "/v1/webhooks/payments", Some(event)).await;

    let (status, body) = send(&t.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains(r#"wrench_reconciliations_total{outcome="created",source="webhook"} 1"#));
    assert!(text.contains(r#"wrench_reconciliations_total{outcome="duplicate",source="webhook"} 1"#));
}
