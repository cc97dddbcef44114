use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use ulid::Ulid;

use slotbook::engine::Engine;

// ── Test infrastructure ──────────────────────────────────────

fn start_test_app() -> (Router, Arc<Engine>) {
    let dir = std::env::temp_dir().join(format!("slotbook_graphql_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotbook.wal")).unwrap());
    (slotbook::http::router(engine.clone(), "unused"), engine)
}

/// POST a GraphQL document and return the decoded response body.
async fn gql(app: &Router, query: &str) -> Value {
    let req = Request::builder()
        .method("POST")
        .uri("/graphql")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "query": query }).to_string()))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn error_code(body: &Value) -> &str {
    body["errors"][0]["extensions"]["code"].as_str().unwrap_or("")
}

async fn create_client(app: &Router, email: &str) -> String {
    let body = gql(
        app,
        &format!(r#"mutation {{ createClient(input: {{ name: "Ada", phone: "1", email: "{email}" }}) {{ ok client {{ id }} }} }}"#),
    )
    .await;
    assert_eq!(body["data"]["createClient"]["ok"], true, "{body}");
    body["data"]["createClient"]["client"]["id"].as_str().unwrap().to_string()
}

async fn create_product(app: &Router, price: f64) -> String {
    let body = gql(
        app,
        &format!(r#"mutation {{ createProduct(input: {{ name: "Lamp", price: {price} }}) {{ ok product {{ id price isActive }} }} }}"#),
    )
    .await;
    assert_eq!(body["data"]["createProduct"]["product"]["isActive"], true, "{body}");
    body["data"]["createProduct"]["product"]["id"].as_str().unwrap().to_string()
}

async fn create_calendar(app: &Router, products: &[&str]) -> String {
    let ids: Vec<String> = products.iter().map(|p| format!("\"{p}\"")).collect();
    let body = gql(
        app,
        &format!(
            r#"mutation {{ createCalendar(input: {{ name: "Studio", productIds: [{}] }}) {{ ok calendar {{ id }} }} }}"#,
            ids.join(", ")
        ),
    )
    .await;
    body["data"]["createCalendar"]["calendar"]["id"].as_str().unwrap().to_string()
}

fn reservation_mutation(client: &str, calendar: &str, start: &str, end: &str, products: &[&str]) -> String {
    let ids: Vec<String> = products.iter().map(|p| format!("\"{p}\"")).collect();
    format!(
        r#"mutation {{
            createReservation(input: {{
                startTime: "{start}", endTime: "{end}",
                clientId: "{client}", calendarId: "{calendar}",
                productIds: [{}]
            }}) {{ ok reservation {{ id totalPrice startTime endTime items {{ id price }} }} }}
        }}"#,
        ids.join(", ")
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn graphiql_page_is_served() {
    let (app, _) = start_test_app();
    let req = Request::builder().uri("/graphql").body(Body::empty()).unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&bytes).contains("graphiql"));
}

#[tokio::test]
async fn create_and_query_everything() {
    let (app, _) = start_test_app();
    let client = create_client(&app, "ada@example.com").await;
    let product = create_product(&app, 12.0).await;
    let calendar = create_calendar(&app, &[&product]).await;

    let body = gql(
        &app,
        &reservation_mutation(&client, &calendar, "2024-05-01T10:00:00Z", "2024-05-01T11:00:00Z", &[&product]),
    )
    .await;
    assert_eq!(body["data"]["createReservation"]["ok"], true, "{body}");
    assert_eq!(body["data"]["createReservation"]["reservation"]["totalPrice"], 12.0);

    let body = gql(
        &app,
        r#"{
            clients { email }
            products { name price }
            calendars { name products { name } reservations { totalPrice } }
            reservations { startTime client { email } calendar { name } items { price product { name } } }
        }"#,
    )
    .await;
    assert!(body["errors"].is_null(), "{body}");
    let data = &body["data"];
    assert_eq!(data["clients"][0]["email"], "ada@example.com");
    assert_eq!(data["products"][0]["price"], 12.0);
    assert_eq!(data["calendars"][0]["products"][0]["name"], "Lamp");
    assert_eq!(data["calendars"][0]["reservations"][0]["totalPrice"], 12.0);
    let start = data["reservations"][0]["startTime"].as_str().unwrap();
    assert!(start.starts_with("2024-05-01T10:00:00"), "{start}");
    assert_eq!(data["reservations"][0]["client"]["email"], "ada@example.com");
    assert_eq!(data["reservations"][0]["items"][0]["product"]["name"], "Lamp");
}

#[tokio::test]
async fn overlapping_reservation_reports_double_booking() {
    let (app, _) = start_test_app();
    let client = create_client(&app, "b@example.com").await;
    let calendar = create_calendar(&app, &[]).await;

    let body = gql(
        &app,
        &reservation_mutation(&client, &calendar, "2024-05-01T10:00:00Z", "2024-05-01T11:00:00Z", &[]),
    )
    .await;
    assert_eq!(body["data"]["createReservation"]["reservation"]["totalPrice"], 0.0);

    let body = gql(
        &app,
        &reservation_mutation(&client, &calendar, "2024-05-01T11:00:00Z", "2024-05-01T12:00:00Z", &[]),
    )
    .await;
    assert_eq!(error_code(&body), "DOUBLE_BOOKING", "{body}");
    assert!(
        body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("trying to double book")
    );
}

#[tokio::test]
async fn update_of_missing_id_is_not_found() {
    let (app, _) = start_test_app();
    let missing = Ulid::new();

    let body = gql(
        &app,
        &format!(r#"mutation {{ updateClient(id: "{missing}", input: {{ name: "x", email: "x@example.com" }}) {{ ok }} }}"#),
    )
    .await;
    assert_eq!(error_code(&body), "NOT_FOUND", "{body}");

    let body = gql(
        &app,
        &format!(r#"mutation {{ updateProduct(id: "{missing}", input: {{ name: "x", price: 1.0 }}) {{ ok }} }}"#),
    )
    .await;
    assert_eq!(error_code(&body), "NOT_FOUND", "{body}");

    let body = gql(&app, &format!(r#"{{ reservation(id: "{missing}") {{ id }} }}"#)).await;
    assert_eq!(error_code(&body), "NOT_FOUND", "{body}");

    let body = gql(&app, r#"{ client(id: "garbage") { id } }"#).await;
    assert_eq!(error_code(&body), "INVALID_INPUT", "{body}");
}

#[tokio::test]
async fn duplicate_email_reports_uniqueness() {
    let (app, _) = start_test_app();
    create_client(&app, "dup@example.com").await;
    let body = gql(
        &app,
        r#"mutation { createClient(input: { name: "Again", email: "dup@example.com" }) { ok } }"#,
    )
    .await;
    assert_eq!(error_code(&body), "UNIQUENESS", "{body}");
    // No partial payload: the field is null and nothing was written.
    assert!(body["data"]["createClient"].is_null(), "{body}");
    assert_eq!(body["errors"][0]["path"][0], "createClient");
}

#[tokio::test]
async fn referenced_client_cannot_be_deleted() {
    let (app, engine) = start_test_app();
    let client = create_client(&app, "c@example.com").await;
    let calendar = create_calendar(&app, &[]).await;
    let body = gql(
        &app,
        &reservation_mutation(&client, &calendar, "2024-05-01T10:00:00Z", "2024-05-01T11:00:00Z", &[]),
    )
    .await;
    let reservation = body["data"]["createReservation"]["reservation"]["id"].as_str().unwrap().to_string();

    let body = gql(&app, &format!(r#"mutation {{ deleteClient(id: "{client}") {{ ok }} }}"#)).await;
    assert_eq!(error_code(&body), "REFERENTIAL_INTEGRITY", "{body}");
    let body = gql(&app, &format!(r#"mutation {{ deleteCalendar(id: "{calendar}") {{ ok }} }}"#)).await;
    assert_eq!(error_code(&body), "REFERENTIAL_INTEGRITY", "{body}");

    let body = gql(&app, &format!(r#"mutation {{ deleteReservation(id: "{reservation}") {{ ok id }} }}"#)).await;
    assert_eq!(body["data"]["deleteReservation"]["id"], reservation.as_str());
    let body = gql(&app, &format!(r#"mutation {{ deleteClient(id: "{client}") {{ ok }} }}"#)).await;
    assert_eq!(body["data"]["deleteClient"]["ok"], true, "{body}");
    assert!(engine.list_clients().is_empty());
}

#[tokio::test]
async fn items_keep_their_price_snapshot() {
    let (app, _) = start_test_app();
    let client = create_client(&app, "d@example.com").await;
    let product = create_product(&app, 10.0).await;
    let calendar = create_calendar(&app, &[]).await;
    let body = gql(
        &app,
        &reservation_mutation(&client, &calendar, "2024-05-02T09:00:00Z", "2024-05-02T10:00:00Z", &[]),
    )
    .await;
    let reservation = body["data"]["createReservation"]["reservation"]["id"].as_str().unwrap().to_string();

    let body = gql(
        &app,
        &format!(
            r#"mutation {{ addReservationItem(reservationId: "{reservation}", productId: "{product}") {{ ok reservationItem {{ id price }} }} }}"#
        ),
    )
    .await;
    assert_eq!(body["data"]["addReservationItem"]["reservationItem"]["price"], 10.0, "{body}");
    let item = body["data"]["addReservationItem"]["reservationItem"]["id"].as_str().unwrap().to_string();

    gql(
        &app,
        &format!(r#"mutation {{ updateProduct(id: "{product}", input: {{ name: "Lamp", price: 99.0 }}) {{ ok }} }}"#),
    )
    .await;
    let body = gql(&app, &format!(r#"{{ reservation(id: "{reservation}") {{ totalPrice }} }}"#)).await;
    assert_eq!(body["data"]["reservation"]["totalPrice"], 10.0);

    let body = gql(&app, &format!(r#"mutation {{ removeReservationItem(id: "{item}") {{ ok }} }}"#)).await;
    assert_eq!(body["data"]["removeReservationItem"]["ok"], true, "{body}");
    let body = gql(&app, &format!(r#"{{ reservation(id: "{reservation}") {{ totalPrice items {{ id }} }} }}"#)).await;
    assert_eq!(body["data"]["reservation"]["totalPrice"], 0.0);
    assert!(body["data"]["reservation"]["items"].as_array().unwrap().is_empty());
}
