use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use ptsched::directory::InMemoryDirectory;
use ptsched::engine::Engine;
use ptsched::policy::SchedulingPolicy;
use ptsched::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("ptsched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let directory = Arc::new(InMemoryDirectory::new());
    let engine = Arc::new(
        Engine::new(dir.join("ptsched.wal"), directory.clone(), SchedulingPolicy::default()).unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let directory = directory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, directory, "ptsched".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("ptsched")
        .user(user)
        .password("ptsched");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

/// Admin connection with two members and one Monday block for `alex`.
async fn seeded(addr: SocketAddr) -> (Client, Ulid) {
    let admin = connect(addr, "admin").await;
    let template = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO members (id, display_name) VALUES ('m-1', 'Jo');
             INSERT INTO members (id) VALUES ('m-2');
             INSERT INTO availability_templates (id, trainer, day_of_week, start_time, end_time)
                 VALUES ('{template}', 'alex', 1, '09:00', '17:00');
             INSERT INTO credit_ledger (member_id, duration, amount) VALUES ('m-1', 60, 2)"
        ))
        .await
        .unwrap();
    (admin, template)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn member_books_a_block_with_credit() {
    let addr = start_test_server().await;
    let (admin, template) = seeded(addr).await;
    let member = connect(addr, "member:m-1").await;

    let result = rows(&member, "SELECT * FROM blocks WHERE date = '2024-06-03' AND trainer = 'alex'").await;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get("template_id"), Some(template.to_string().as_str()));
    assert!(result[0].get("starts_60").unwrap().starts_with(r#"["09:00""#));
    assert_eq!(result[0].get("my_booking_id"), None);

    let booking = Ulid::new();
    let result = rows(
        &member,
        &format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id)
             VALUES ('{booking}', '{template}', '2024-06-03', '09:00', 60, 'm-1')"
        ),
    )
    .await;
    assert_eq!(result[0].get("booking_id"), Some(booking.to_string().as_str()));
    assert_eq!(result[0].get("ok"), Some("t"));
    assert_eq!(result[0].get("reason"), None);
    assert_eq!(result[0].get("balance"), Some("1"));

    // The reserve pushes the next 60-minute start to 10:15.
    let result = rows(&member, "SELECT * FROM blocks WHERE date = '2024-06-03'").await;
    assert!(result[0].get("starts_60").unwrap().starts_with(r#"["10:15""#));
    assert_eq!(result[0].get("my_booking_id"), Some(booking.to_string().as_str()));

    let result = rows(&member, "SELECT * FROM credit_balance WHERE member_id = 'm-1' AND duration = 60").await;
    assert_eq!(result[0].get("balance"), Some("1"));

    // Staff see who holds the time.
    let result = rows(&admin, "SELECT * FROM segments WHERE date = '2024-06-03'").await;
    let booked: Vec<_> = result.iter().filter(|r| r.get("kind") == Some("booked")).collect();
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("label"), Some("Jo"));
    assert_eq!(booked[0].get("end_time"), Some("10:15"));

    let err = member
        .simple_query("SELECT * FROM segments WHERE date = '2024-06-03'")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forbidden"));
}

#[tokio::test]
async fn rejected_booking_is_reported_in_band() {
    let addr = start_test_server().await;
    let (admin, template) = seeded(addr).await;

    let first = Ulid::new();
    let second = Ulid::new();
    admin
        .simple_query(&format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id, payment)
             VALUES ('{first}', '{template}', '2024-06-03', '09:00', 60, 'm-2', 'paid')"
        ))
        .await
        .unwrap();
    let result = rows(
        &admin,
        &format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id, payment)
             VALUES ('{second}', '{template}', '2024-06-03', '10:00', 60, 'm-1', 'paid')"
        ),
    )
    .await;
    assert_eq!(result[0].get("ok"), Some("f"));
    assert_eq!(result[0].get("reason"), Some("slot_unavailable"));

    let result = rows(
        &admin,
        &format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id)
             VALUES ('{second}', '{template}', '2024-06-03', '13:00', 90, 'm-2')"
        ),
    )
    .await;
    assert_eq!(result[0].get("ok"), Some("f"));
    assert_eq!(result[0].get("reason"), Some("insufficient_credit"));
    assert_eq!(result[0].get("balance"), Some("0"));
}

#[tokio::test]
async fn cancel_refunds_and_repeats_as_noop() {
    let addr = start_test_server().await;
    let (admin, template) = seeded(addr).await;
    let member = connect(addr, "member:m-1").await;

    let booking = Ulid::new();
    member
        .simple_query(&format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id)
             VALUES ('{booking}', '{template}', '2024-06-03', '11:00', 60, 'm-1')"
        ))
        .await
        .unwrap();

    let deleted = member
        .execute("DELETE FROM bookings WHERE id = $1", &[&booking.to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    let deleted = member
        .execute("DELETE FROM bookings WHERE id = $1", &[&booking.to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, 0);

    let result = rows(&admin, "SELECT * FROM credit_balance WHERE member_id = 'm-1' AND duration = 60").await;
    assert_eq!(result[0].get("balance"), Some("2"));
}

#[tokio::test]
async fn extended_protocol_booking_lookup() {
    let addr = start_test_server().await;
    let (admin, template) = seeded(addr).await;

    let booking = Ulid::new();
    let row = admin
        .query_one(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id)
             VALUES ($1, $2, '2024-06-03', '09:00', 60, 'm-1')",
            &[&booking.to_string(), &template.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>("booking_id"), booking.to_string());
    assert_eq!(row.get::<_, Option<String>>("reason"), None);

    let row = admin
        .query_one("SELECT * FROM bookings WHERE id = $1", &[&booking.to_string()])
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>("modality"), "block");
    assert_eq!(row.get::<_, String>("start_time"), "09:00");
    assert_eq!(row.get::<_, Option<String>>("member_id").as_deref(), Some("m-1"));
    assert_eq!(row.get::<_, Option<String>>("guest_name"), None);
    assert_eq!(row.get::<_, String>("payment"), "credit");
}

#[tokio::test]
async fn class_timetable_and_settlement() {
    let addr = start_test_server().await;
    let (admin, _) = seeded(addr).await;

    let product = Ulid::new();
    let booking = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO session_products (id, trainer, duration) VALUES ('{product}', 'alex', 60);
             INSERT INTO open_bookings (id, product_id, date, start_time, member_id, payment)
                 VALUES ('{booking}', '{product}', '2024-06-03', '10:00', 'm-1', 'paid')"
        ))
        .await
        .unwrap();

    // PT holds 10:00 so the class claim is skipped.
    let claimed = admin
        .execute("INSERT INTO class_cells (date, time) VALUES ('2024-06-03', '10:00')", &[])
        .await
        .unwrap();
    assert_eq!(claimed, 0);
    let claimed = admin
        .execute("INSERT INTO class_cells (date, time) VALUES ('2024-06-03', '18:00')", &[])
        .await
        .unwrap();
    assert_eq!(claimed, 1);

    let result = rows(&admin, "SELECT * FROM pt_occupancy WHERE date = '2024-06-03' AND time = '18:10'").await;
    assert_eq!(result[0].get("cell"), Some("18:00"));
    assert_eq!(result[0].get("pt_occupied"), Some("f"));
    assert_eq!(result[0].get("class_occupied"), Some("t"));

    let result = rows(&admin, "SELECT * FROM settle_open_bookings WHERE now = '2024-06-03 12:00'").await;
    assert_eq!(result[0].get("processed"), Some("1"));
    assert_eq!(result[0].get("docked"), Some("1"));
    assert_eq!(result[0].get("member_id"), None);
    // Docked down to one credit: low-balance alert.
    assert_eq!(result.len(), 2);
    assert_eq!(result[1].get("member_id"), Some("m-1"));
    assert_eq!(result[1].get("duration"), Some("60"));
    assert_eq!(result[1].get("balance"), Some("1"));

    let result = rows(&admin, "SELECT * FROM credit_balance WHERE member_id = 'm-1'").await;
    let sixty = result.iter().find(|r| r.get("duration") == Some("60")).unwrap();
    assert_eq!(sixty.get("balance"), Some("1"));

    let result = rows(&admin, "SELECT * FROM settle_open_bookings WHERE now = '2024-06-03 12:00'").await;
    assert_eq!(result[0].get("processed"), Some("0"));
}

#[tokio::test]
async fn roles_are_enforced() {
    let addr = start_test_server().await;
    let (_admin, template) = seeded(addr).await;

    let stranger = connect(addr, "somebody").await;
    let err = stranger.simple_query("SELECT * FROM ledger_audit").await.unwrap_err();
    assert_eq!(sqlstate(&err), "28000");

    let member = connect(addr, "member:m-2").await;
    let err = member
        .simple_query("INSERT INTO credit_ledger (member_id, duration, amount) VALUES ('m-2', 60, 5)")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forbidden"));

    let result = rows(
        &member,
        &format!(
            "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id, payment)
             VALUES ('{}', '{template}', '2024-06-03', '09:00', 60, 'm-1', 'paid')",
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(result[0].get("reason"), Some("forbidden"));

    let trainer = connect(addr, "trainer:sam").await;
    let err = trainer
        .simple_query(&format!("DELETE FROM availability_templates WHERE id = '{template}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forbidden"));
}

#[tokio::test]
async fn malformed_statements_are_rejected() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    let err = admin.simple_query("SELECT * FROM nothing").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = admin
        .simple_query("INSERT INTO class_cells (date, time) VALUES ('2024-06-03', '25:00')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = admin
        .simple_query("SELECT * FROM blocks WHERE date >= '2024-06-09' AND date <= '2024-06-03'")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid_range"));
}
