use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use ulid::Ulid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use roomsync::api::{self, AppState};
use roomsync::config::Config;
use roomsync::engine::Engine;
use roomsync::fetch::HttpFetcher;
use roomsync::groups::Groups;
use roomsync::notify::NotifyHub;
use roomsync::payment::{DisabledGateway, PaymentGateway, StripeGateway};

const TOKEN: &str = "test-admin-token";

const AIRBNB_FEED: &str = "BEGIN:VCALENDAR\r\n\
    VERSION:2.0\r\n\
    BEGIN:VEVENT\r\n\
    DTSTART;VALUE=DATE:20251110\r\n\
    DTEND;VALUE=DATE:20251113\r\n\
    SUMMARY:Reserved\r\n\
    END:VEVENT\r\n\
    END:VCALENDAR\r\n";

struct TestApp {
    base: String,
    client: reqwest::Client,
    engine: Arc<Engine>,
    airbnb: Ulid,
    booking: Ulid,
    hidden: Ulid,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn admin(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(TOKEN)
    }
}

async fn spawn_app(feeds: &MockServer, stripe: Option<&MockServer>) -> TestApp {
    let dir = std::env::temp_dir().join(format!("roomsync_http_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let mut vars = HashMap::new();
    vars.insert("ROOMSYNC_DATA_DIR", dir.display().to_string());
    vars.insert("ROOMSYNC_ADMIN_TOKEN", TOKEN.to_string());
    vars.insert("STRIPE_PUBLISHABLE_KEY", "pk_test_1".to_string());

    let engine = Arc::new(
        Engine::new(dir.join("roomsync.wal"), Arc::new(NotifyHub::new())).unwrap(),
    );
    let airbnb = engine
        .create_unit("Airbnb", "A-1", Some(format!("{}/airbnb.ics", feeds.uri())))
        .await
        .unwrap();
    let booking = engine
        .create_unit("Booking.com", "B-1", Some(format!("{}/booking.ics", feeds.uri())))
        .await
        .unwrap();
    let hidden = engine.create_unit("Agoda", "C-1", None).await.unwrap();
    engine
        .set_rate_plan(airbnb, 1000.0, Some(1500.0), Some("thb"))
        .await
        .unwrap();
    vars.insert("IGNORE_PUBLIC_UNIT_IDS", hidden.to_string());

    let config = Config::from_lookup(|key| vars.get(key).cloned());
    let groups = Groups::from_json(&format!(
        r#"{{"groups": {{
            "villa": {{"title": "Villa Sunset", "unit_ids": ["{airbnb}", "{booking}", "{hidden}"]}},
            "studio": {{"unit_ids": ["{booking}"]}},
            "empty": {{"title": "Coming soon"}}
        }}}}"#
    ))
    .unwrap();

    let payments: Arc<dyn PaymentGateway> = match stripe {
        Some(server) => Arc::new(
            StripeGateway::new("sk_test".into())
                .unwrap()
                .with_base_url(server.uri()),
        ),
        None => Arc::new(DisabledGateway),
    };

    let state = AppState {
        engine: engine.clone(),
        groups: Arc::new(groups),
        fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap()),
        payments,
        config: Arc::new(config),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    TestApp {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        engine,
        airbnb,
        booking,
        hidden,
    }
}

#[tokio::test]
async fn sync_everything_and_check_feeds() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let statuses = |body: Value| -> Vec<String> {
        body["summary"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["status"].as_str().unwrap().to_string())
            .collect()
    };

    let res = app
        .admin(app.client.post(app.url("/api/admin/sync_now")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        statuses(res.json().await.unwrap()),
        vec!["OK — 1 events", "ERROR — 503 Service Unavailable", "skipped (no iCal URL)"]
    );
    assert!(app.engine.unit_info(app.airbnb).await.unwrap().last_sync.is_some());

    let res = app
        .admin(app.client.get(app.url("/api/admin/check_ical")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let checks: Vec<Value> = res.json().await.unwrap();
    let checks: Vec<&str> = checks.iter().map(|o| o["status"].as_str().unwrap()).collect();
    assert_eq!(checks, vec!["OK (1 events)", "Unexpected (503)", "(empty — add later)"]);
}

async fn feed_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/airbnb.ics"))
        .respond_with(ResponseTemplate::new(200).set_body_string(AIRBNB_FEED))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/booking.ics"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn health_and_admin_auth() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let res = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), 200);

    let res = app.client.get(app.url("/api/admin/units")).send().await.unwrap();
    assert_eq!(res.status(), 401);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let res = app
        .client
        .get(app.url("/api/admin/units"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = app
        .admin(app.client.get(app.url("/api/admin/units")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let units: Vec<Value> = res.json().await.unwrap();
    assert_eq!(units.len(), 3);
}

#[tokio::test]
async fn sync_then_book_group() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let res = app
        .admin(app.client.post(app.url("/api/admin/sync_property/villa")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    let statuses: Vec<&str> = body["summary"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["status"].as_str().unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec!["OK — 1 events", "ERROR — 503 Service Unavailable", "skipped (no iCal URL)"]
    );

    // Synced Airbnb dates block the whole group.
    let res = app
        .client
        .post(app.url("/api/public/book_group/villa"))
        .json(&json!({"start_date": "2025-11-12", "end_date": "2025-11-14", "name": "Ada", "email": "ada@example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 409);

    let res = app
        .client
        .post(app.url("/api/public/book_group/villa"))
        .json(&json!({"start_date": "2025-11-13", "end_date": "2025-11-15", "name": "Ada", "email": "ada@example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["block_ids"].as_array().unwrap().len(), 3);

    for unit in [app.airbnb, app.booking, app.hidden] {
        let blocks = app.engine.list_blocks(Some(unit)).await;
        let direct: Vec<_> = blocks.iter().filter(|b| b.source == "direct").collect();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].note, "Guest: Ada ada@example.com (group:villa)");
    }

    let res = app
        .client
        .get(app.url("/api/public/availability/villa"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let entries: Vec<Value> = res.json().await.unwrap();
    assert!(entries.iter().any(|e| e["source"] == "airbnb"));
    assert!(entries.iter().any(|e| e["source"] == "ical"));
    assert_eq!(entries.iter().filter(|e| e["source"] == "direct").count(), 3);
}

#[tokio::test]
async fn booking_validation_errors() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let cases = [
        ("/api/public/book_group/nope", json!({"start_date": "2025-11-01", "end_date": "2025-11-02", "name": "A", "email": "a@b.c"}), 404),
        ("/api/public/book_group/empty", json!({"start_date": "2025-11-01", "end_date": "2025-11-02", "name": "A", "email": "a@b.c"}), 400),
        ("/api/public/book_group/villa", json!({"start_date": "2025-11-01", "end_date": "2025-11-02", "name": "", "email": "a@b.c"}), 400),
        ("/api/public/book_group/villa", json!({"start_date": "2025-11-02", "end_date": "2025-11-02", "name": "A", "email": "a@b.c"}), 400),
        ("/api/public/book_group/villa", json!({"start_date": "2025-11-01", "name": "A", "email": "a@b.c"}), 400),
        ("/api/public/book/not-a-unit-id", json!({"start_date": "2025-11-01", "end_date": "2025-11-02", "name": "A", "email": "a@b.c"}), 400),
    ];
    for (path, body, status) in cases {
        let res = app.client.post(app.url(path)).json(&body).send().await.unwrap();
        assert_eq!(res.status(), status, "{path} {body}");
        let err: Value = res.json().await.unwrap();
        assert!(err["error"].is_string());
    }

    let res = app
        .client
        .post(app.url(&format!("/api/public/book/{}", Ulid::new())))
        .json(&json!({"start_date": "2025-11-01", "end_date": "2025-11-02", "name": "A", "email": "a@b.c"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn quote_and_payment_intent() {
    let feeds = feed_server().await;
    let stripe = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"client_secret":"pi_123_secret_abc"}"#),
        )
        .expect(1)
        .mount(&stripe)
        .await;
    let app = spawn_app(&feeds, Some(&stripe)).await;

    // Thu, Fri, Sat nights: 1000 + 1500 + 1500.
    let stay = json!({"start_date": "2025-11-20", "end_date": "2025-11-23"});
    let res = app
        .client
        .post(app.url("/api/public/quote/villa"))
        .json(&stay)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let quote: Value = res.json().await.unwrap();
    assert_eq!(quote["total"], 4000.0);
    assert_eq!(quote["nights"], 3);
    assert_eq!(quote["currency"], "THB");
    assert_eq!(quote["available"], true);

    let res = app
        .client
        .post(app.url("/api/public/create_intent/villa"))
        .json(&stay)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["client_secret"], "pi_123_secret_abc");
    assert_eq!(body["amount"], 400000);
    assert_eq!(body["currency"], "thb");

    let sent = &stripe.received_requests().await.unwrap()[0];
    let form = String::from_utf8_lossy(&sent.body);
    assert!(form.contains("amount=400000"));
    assert!(form.contains("currency=thb"));

    let res = app
        .client
        .get(app.url("/api/public/config"))
        .send()
        .await
        .unwrap();
    let config: Value = res.json().await.unwrap();
    assert_eq!(config["stripe_publishable_key"], "pk_test_1");
}

#[tokio::test]
async fn unpriced_night_and_disabled_payments() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let res = app
        .client
        .post(app.url("/api/public/create_intent/villa"))
        .json(&json!({"start_date": "2025-11-20", "end_date": "2025-11-21"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 503);

    // The studio's unit has no rate plan: only overridden nights can be priced.
    let two_nights = json!({"start_date": "2025-11-20", "end_date": "2025-11-22"});
    let res = app
        .client
        .post(app.url("/api/public/quote/studio"))
        .json(&two_nights)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 422);

    let res = app
        .admin(app.client.post(app.url(&format!("/api/admin/units/{}/date-rates", app.booking))))
        .json(&json!({"date": "2025-11-20", "price": 800.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let res = app
        .client
        .post(app.url("/api/public/quote/studio"))
        .json(&two_nights)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 422);

    let res = app
        .client
        .post(app.url("/api/public/quote/studio"))
        .json(&json!({"start_date": "2025-11-20", "end_date": "2025-11-21"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let quote: Value = res.json().await.unwrap();
    assert_eq!(quote["total"], 800.0);
    assert_eq!(quote["currency"], "THB");
    assert_eq!(quote["breakdown"][0]["is_override"], true);
}

#[tokio::test]
async fn admin_blocks_toggle_and_export() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let res = app
        .admin(app.client.post(app.url("/api/admin/blocks")))
        .json(&json!({"unit_id": app.airbnb, "start_date": "2025-12-01", "end_date": "2025-12-04", "note": "painting"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    let block_id = res.json::<Value>().await.unwrap()["id"].as_str().unwrap().to_string();

    let res = app
        .admin(app.client.post(app.url("/api/admin/toggle_day/villa")))
        .json(&json!({"date": "2025-12-24", "action": "block"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.json::<Value>().await.unwrap()["changed"], 3);

    let res = app
        .admin(app.client.post(app.url("/api/admin/toggle_day/villa")))
        .json(&json!({"date": "2025-12-24", "action": "explode"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);

    let blocks: Vec<Value> = app
        .admin(app.client.get(app.url(&format!("/api/admin/blocks?unit_id={}", app.airbnb))))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["start_date"], "2025-12-24");
    assert_eq!(blocks[0]["note"], "admin calendar (villa)");

    let res = app.client.get(app.url(&format!("/ical/export/{}.ics", app.airbnb))).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/calendar")
    );
    let ics = res.text().await.unwrap();
    assert!(ics.starts_with("BEGIN:VCALENDAR\r\n"));
    assert!(ics.contains(&format!("UID:cm-{}-{block_id}@roomsync", app.airbnb)));
    assert!(ics.contains("SUMMARY:BLOCKED (Airbnb A-1)"));
    assert!(ics.contains("DTSTART;VALUE=DATE:20251201"));

    let res = app
        .admin(app.client.delete(app.url(&format!("/api/admin/blocks?id={block_id}"))))
        .send()
        .await
        .unwrap();
    assert_eq!(res.json::<Value>().await.unwrap()["removed"], true);

    let res = app.client.get(app.url("/ical/export/not-a-unit.ics")).send().await.unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn public_listing_hides_ignored_units() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let res = app.client.get(app.url("/api/public/properties")).send().await.unwrap();
    let props: Value = res.json().await.unwrap();
    let villa = &props["villa"];
    assert_eq!(villa["title"], "Villa Sunset");
    assert_eq!(villa["price"], 1000.0);
    assert_eq!(villa["currency"], "THB");
    let ids: Vec<&str> = villa["unit_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&app.hidden.to_string().as_str()));
    assert_eq!(props["empty"]["price"], Value::Null);
    assert!(props["empty"]["image_url"].as_str().unwrap().starts_with("https://"));
}

#[tokio::test]
async fn csv_import_is_all_or_nothing() {
    let feeds = feed_server().await;
    let app = spawn_app(&feeds, None).await;

    let bad = "OTA Name,Property ID / Room ID,iCal URL\nVrbo,1,https://v.example/a.ics\nDirect,2,\n";
    let res = app
        .admin(app.client.post(app.url("/api/admin/import")))
        .body(bad)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let err: Value = res.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().starts_with("line 3:"));
    assert_eq!(app.engine.list_units().await.len(), 3);

    let good = "OTA Name,Property ID / Room ID,iCal URL\nVrbo,1,https://v.example/a.ics\nExpedia,2,\n";
    let res = app
        .admin(app.client.post(app.url("/api/admin/import")))
        .body(good)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    assert_eq!(app.engine.list_units().await.len(), 5);

    let links: Vec<Value> = app
        .admin(app.client.get(app.url("/api/admin/export_links")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(links.len(), 5);
    assert!(links[0]["url"].as_str().unwrap().ends_with(".ics"));
}
