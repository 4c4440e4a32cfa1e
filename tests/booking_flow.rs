use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use bookd::clock::SystemClock;
use bookd::config::EngineConfig;
use bookd::engine::{Collaborators, Engine};
use bookd::gateway::SandboxGateway;
use bookd::notify::NotifyHub;
use bookd::wire;

const DAY_MS: i64 = 86_400_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bookd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("bookd.wal"),
            EngineConfig::default(),
            Collaborators {
                gateway: Arc::new(SandboxGateway::new()),
                notifier: Arc::new(NotifyHub::new()),
                clock: Arc::new(SystemClock),
            },
        )
        .unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "bookd".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_as(addr: SocketAddr, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("bookd")
        .user(user)
        .password("bookd");

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    connect_as(addr, user).await.unwrap()
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

struct Parties {
    customer: Client,
    professional: Client,
    gateway: Client,
    professional_id: Ulid,
}

async fn parties(addr: SocketAddr) -> Parties {
    let customer_id = Ulid::new();
    let professional_id = Ulid::new();
    Parties {
        customer: connect(addr, &format!("customer:{customer_id}")).await,
        professional: connect(addr, &format!("professional:{professional_id}")).await,
        gateway: connect(addr, "gateway").await,
        professional_id,
    }
}

async fn request_booking(p: &Parties) -> Ulid {
    let id = Ulid::new();
    let start = now_ms() + 7 * DAY_MS;
    p.customer
        .simple_query(&format!(
            "INSERT INTO bookings (id, professional_id, project_id, subproject_index, service_type, description, desired_start, budget_min, budget_max) \
             VALUES ('{id}', '{}', NULL, NULL, 'plumbing', 'leaking tap', {start}, 10000, 200000)",
            p.professional_id
        ))
        .await
        .unwrap();
    id
}

// ── Booking lifecycle over the wire ──────────────────────────

#[tokio::test]
async fn professional_booking_reaches_booked() {
    let (addr, _engine) = start_test_server().await;
    let p = parties(addr).await;
    let booking = request_booking(&p).await;

    let rows = select(&p.customer, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("rfq"));
    assert_eq!(rows[0].get("booking_type"), Some("professional"));

    p.professional
        .simple_query(&format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{booking}', 150000, 'EUR', 'new tap and labour')"
        ))
        .await
        .unwrap();
    p.customer
        .simple_query(&format!(
            "INSERT INTO quote_responses (booking_id, action) VALUES ('{booking}', 'accept')"
        ))
        .await
        .unwrap();

    let rows = select(&p.customer, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("payment_pending"));
    assert_eq!(rows[0].get("quote_amount"), Some("150000"));
    assert_eq!(rows[0].get("currency"), Some("EUR"));

    p.gateway
        .simple_query(&format!(
            "INSERT INTO payment_callbacks (booking_id, outcome, reference) VALUES ('{booking}', 'authorized', 'pi_wire')"
        ))
        .await
        .unwrap();

    let rows = select(&p.professional, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("booked"));

    let rows = select(&p.customer, &format!("SELECT * FROM payments WHERE booking_id = '{booking}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("authorized"));
    assert_eq!(rows[0].get("amount"), Some("150000"));
    assert_eq!(rows[0].get("gateway_reference"), Some("pi_wire"));
}

#[tokio::test]
async fn completion_captures_payment() {
    let (addr, _engine) = start_test_server().await;
    let p = parties(addr).await;
    let booking = request_booking(&p).await;

    p.professional
        .simple_query(&format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{booking}', 90000, 'EUR', 'fix')"
        ))
        .await
        .unwrap();
    p.customer
        .simple_query(&format!(
            "INSERT INTO quote_responses (booking_id, action) VALUES ('{booking}', 'accept')"
        ))
        .await
        .unwrap();
    p.gateway
        .simple_query(&format!(
            "INSERT INTO payment_callbacks (booking_id, outcome, reference) VALUES ('{booking}', 'authorized', 'pi_1')"
        ))
        .await
        .unwrap();
    p.professional
        .simple_query(&format!(
            "INSERT INTO transitions (booking_id, status) VALUES ('{booking}', 'in_progress')"
        ))
        .await
        .unwrap();
    p.customer
        .simple_query(&format!(
            "INSERT INTO transitions (booking_id, status) VALUES ('{booking}', 'completed')"
        ))
        .await
        .unwrap();

    let rows = select(&p.customer, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("completed"));
    let rows = select(&p.customer, &format!("SELECT * FROM payments WHERE booking_id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("completed"));
    assert_eq!(rows[0].get("capture_attempts"), Some("1"));
}

#[tokio::test]
async fn declined_authorization_can_be_retried() {
    let (addr, _engine) = start_test_server().await;
    let p = parties(addr).await;
    let booking = request_booking(&p).await;

    p.professional
        .simple_query(&format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{booking}', 50000, 'EUR', 'fix')"
        ))
        .await
        .unwrap();
    p.customer
        .simple_query(&format!(
            "INSERT INTO quote_responses (booking_id, action) VALUES ('{booking}', 'accept')"
        ))
        .await
        .unwrap();
    p.gateway
        .simple_query(&format!(
            "INSERT INTO payment_callbacks (booking_id, outcome, reference) VALUES ('{booking}', 'declined', 'insufficient funds')"
        ))
        .await
        .unwrap();

    let rows = select(&p.customer, &format!("SELECT * FROM payments WHERE booking_id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("failed"));

    p.customer
        .simple_query(&format!("INSERT INTO payment_retries (booking_id) VALUES ('{booking}')"))
        .await
        .unwrap();
    let rows = select(&p.customer, &format!("SELECT * FROM payments WHERE booking_id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("pending"));
}

// ── Errors and access ────────────────────────────────────────

#[tokio::test]
async fn errors_carry_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let p = parties(addr).await;
    let booking = request_booking(&p).await;

    // Customers cannot quote.
    let code = sqlstate(
        &p.customer,
        &format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{booking}', 100, 'EUR', 'x')"
        ),
    )
    .await;
    assert_eq!(code, "42501");

    // Unknown currency.
    let code = sqlstate(
        &p.professional,
        &format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{booking}', 100, 'eur', 'x')"
        ),
    )
    .await;
    assert_eq!(code, "22023");

    // Illegal edge: rfq -> completed.
    let code = sqlstate(
        &p.professional,
        &format!("INSERT INTO transitions (booking_id, status) VALUES ('{booking}', 'completed')"),
    )
    .await;
    assert_eq!(code, "P0001");

    let code = sqlstate(&p.customer, &format!("SELECT * FROM bookings WHERE id = '{}'", Ulid::new())).await;
    assert_eq!(code, "P0002");

    let code = sqlstate(&p.customer, "SELEKT nonsense").await;
    assert_eq!(code, "42601");
}

#[tokio::test]
async fn bookings_visible_to_parties_only() {
    let (addr, _engine) = start_test_server().await;
    let p = parties(addr).await;
    let booking = request_booking(&p).await;

    let stranger = connect(addr, &format!("customer:{}", Ulid::new())).await;
    let code = sqlstate(&stranger, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(code, "42501");

    let admin = connect(addr, "admin").await;
    let rows = select(&admin, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn login_requires_identity() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_as(addr, "bob").await.is_err());
    assert!(connect_as(addr, "customer:not-a-ulid").await.is_err());
    assert!(connect_as(addr, "admin").await.is_ok());
}

// ── Calendars and proposals ──────────────────────────────────

async fn company_with_project(addr: SocketAddr) -> (Client, Ulid, Ulid) {
    let company = Ulid::new();
    let project = Ulid::new();
    let pro = connect(addr, &format!("professional:{company}")).await;

    pro.simple_query(&format!(
        "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{company}', 'company', NULL, NULL, 'Europe/Amsterdam')"
    ))
    .await
    .unwrap();

    let days = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|d| format!("('{company}', '{d}', '00:00', '24:00')"))
        .collect::<Vec<_>>()
        .join(", ");
    pro.simple_query(&format!(
        r#"INSERT INTO weekly_hours (resource_id, day, start, "end") VALUES {days}"#
    ))
    .await
    .unwrap();

    let subprojects = format!(
        r#"[{{"name":"kitchen","pricing":{{"fixed":{{"amount_cents":250000}}}},"execution":{{"value":2,"unit":"days"}},"buffer":{{"value":1,"unit":"days"}},"resources":["{company}"]}}]"#
    );
    pro.simple_query(&format!(
        "INSERT INTO projects (id, company_id, category, subprojects) VALUES ('{project}', '{company}', 'renovation', '{subprojects}')"
    ))
    .await
    .unwrap();

    (pro, company, project)
}

#[tokio::test]
async fn schedule_proposals_in_days_mode() {
    let (addr, _engine) = start_test_server().await;
    let (pro, company, project) = company_with_project(addr).await;

    let rows = select(
        &pro,
        &format!(
            "SELECT * FROM schedule_proposals WHERE project_id = '{project}' AND subproject_index = 0"
        ),
    )
    .await;
    assert!(!rows.is_empty());
    assert_eq!(rows[0].get("kind"), Some("earliest"));
    assert_eq!(rows[0].get("mode"), Some("days"));
    assert_eq!(rows[0].get("resources"), Some(company.to_string().as_str()));

    let start: i64 = rows[0].get("start").unwrap().parse().unwrap();
    let earliest: i64 = rows[0].get("earliest_bookable").unwrap().parse().unwrap();
    assert!(start >= earliest);
    // Day labels are plain dates.
    assert_eq!(rows[0].get("start_label").unwrap().len(), "2025-06-03".len());
}

#[tokio::test]
async fn blocked_range_removes_free_time() {
    let (addr, _engine) = start_test_server().await;
    let (pro, company, _project) = company_with_project(addr).await;

    let from = (now_ms() / DAY_MS + 10) * DAY_MS;
    let to = from + DAY_MS;
    let block = Ulid::new();
    pro.simple_query(&format!(
        r#"INSERT INTO blocked_ranges (id, resource_id, start, "end", reason) VALUES ('{block}', '{company}', {from}, {to}, 'holiday')"#
    ))
    .await
    .unwrap();

    let free = format!(
        r#"SELECT * FROM free_spans WHERE resource_id = '{company}' AND start >= {from} AND "end" <= {to}"#
    );
    assert!(select(&pro, &free).await.is_empty());

    pro.simple_query(&format!("DELETE FROM blocked_ranges WHERE id = '{block}'"))
        .await
        .unwrap();
    let rows = select(&pro, &free).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("start"), Some(from.to_string().as_str()));
    assert_eq!(rows[0].get("end"), Some(to.to_string().as_str()));
}

#[tokio::test]
async fn customers_cannot_edit_calendars() {
    let (addr, _engine) = start_test_server().await;
    let customer = connect(addr, &format!("customer:{}", Ulid::new())).await;
    let code = sqlstate(
        &customer,
        &format!(
            "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{}', 'company', NULL, NULL, 'UTC')",
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(code, "42501");
}
