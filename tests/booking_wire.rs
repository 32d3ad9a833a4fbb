use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotbook::auth::AccessPolicy;
use slotbook::engine::{Engine, today};
use slotbook::wire;

const PASSWORD: &str = "slotbook";

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    admin: Ulid,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotbook.wal")).unwrap());

    let admin = Ulid::new();
    let policy = Arc::new(AccessPolicy::new(
        PASSWORD.to_string(),
        HashSet::from([admin]),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, policy, None).await;
            });
        }
    });

    TestServer { addr, admin }
}

async fn try_connect(addr: SocketAddr, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: Ulid) -> Client {
    try_connect(addr, &user.to_string()).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// A service, a master who performs it, and a 09:00-18:00 schedule on every day.
struct Salon {
    service: Ulid,
    master: Ulid,
}

async fn open_salon(admin: &Client) -> Salon {
    let service = Ulid::new();
    let master = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO services (id, title, duration, price) VALUES ('{service}', 'Haircut', 60, 2500)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO masters (id, name, bio, experience_years) VALUES ('{master}', 'Anna', 'Stylist', 5)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO master_services (master_id, service_id) VALUES ('{master}', '{service}')"
        ))
        .await
        .unwrap();

    let week: Vec<String> = (0..7)
        .map(|day| format!("('{master}', {day}, '09:00', '18:00', true)"))
        .collect();
    admin
        .batch_execute(&format!(
            "INSERT INTO schedules (master_id, day_of_week, start_time, end_time, is_available) VALUES {}",
            week.join(", ")
        ))
        .await
        .unwrap();

    Salon { service, master }
}

fn tomorrow() -> String {
    (today() + chrono::Days::new(1)).to_string()
}

fn book_sql(id: Ulid, salon: &Salon, date: &str, time: &str) -> String {
    format!(
        "INSERT INTO bookings (id, service_id, master_id, \"date\", \"time\") VALUES ('{id}', '{}', '{}', '{date}', '{time}')",
        salon.service, salon.master
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_then_admin_confirms() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;

    let customer_id = Ulid::new();
    let customer = connect(server.addr, customer_id).await;
    let booking = Ulid::new();
    let date = tomorrow();
    customer
        .batch_execute(&book_sql(booking, &salon, &date, "10:00"))
        .await
        .unwrap();

    let mine = rows(&customer, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(booking.to_string().as_str()));
    assert_eq!(mine[0].get("user_id"), Some(customer_id.to_string().as_str()));
    assert_eq!(mine[0].get("status"), Some("pending"));
    assert_eq!(mine[0].get("time"), Some("10:00"));

    admin
        .batch_execute(&format!(
            "INSERT INTO status_changes (booking_id, status, comment) VALUES ('{booking}', 'confirmed', 'see you')"
        ))
        .await
        .unwrap();

    let mine = rows(&customer, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(mine[0].get("status"), Some("confirmed"));
    assert_eq!(mine[0].get("admin_comment"), Some("see you"));

    let history = rows(
        &customer,
        &format!("SELECT * FROM status_changes WHERE booking_id = '{booking}'"),
    )
    .await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get("old_status"), Some("pending"));
    assert_eq!(history[0].get("new_status"), Some("confirmed"));
    assert_eq!(history[0].get("actor_id"), Some(server.admin.to_string().as_str()));
}

#[tokio::test]
async fn double_booking_is_unique_violation() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;
    let date = tomorrow();

    let first = connect(server.addr, Ulid::new()).await;
    first
        .batch_execute(&book_sql(Ulid::new(), &salon, &date, "11:00"))
        .await
        .unwrap();

    let second = connect(server.addr, Ulid::new()).await;
    let err = second
        .batch_execute(&book_sql(Ulid::new(), &salon, &date, "11:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));

    let availability = rows(
        &second,
        &format!(
            "SELECT * FROM availability WHERE master_id = '{}' AND \"date\" = '{date}' AND \"time\" = '11:00'",
            salon.master
        ),
    )
    .await;
    assert_eq!(availability[0].get("available"), Some("f"));
    assert_eq!(availability[0].get("reason"), Some("time slot already booked"));
}

#[tokio::test]
async fn customer_delete_cancels_and_frees_slot() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;
    let date = tomorrow();

    let customer = connect(server.addr, Ulid::new()).await;
    let booking = Ulid::new();
    customer
        .batch_execute(&book_sql(booking, &salon, &date, "12:00"))
        .await
        .unwrap();
    customer
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap();

    let mine = rows(&customer, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("status"), Some("cancelled"));

    let other = connect(server.addr, Ulid::new()).await;
    other
        .batch_execute(&book_sql(Ulid::new(), &salon, &date, "12:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn customers_cannot_touch_catalog_or_others() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;

    let owner = connect(server.addr, Ulid::new()).await;
    let booking = Ulid::new();
    owner
        .batch_execute(&book_sql(booking, &salon, &tomorrow(), "13:00"))
        .await
        .unwrap();

    let stranger = connect(server.addr, Ulid::new()).await;
    let err = stranger
        .batch_execute(&format!(
            "INSERT INTO services (id, title, duration, price) VALUES ('{}', 'Shave', 30, 900)",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = stranger
        .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = stranger
        .simple_query("SELECT * FROM admin_stats")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    assert!(rows(&stranger, "SELECT * FROM bookings").await.is_empty());
}

#[tokio::test]
async fn slots_over_extended_protocol() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;
    let date = tomorrow();

    let customer = connect(server.addr, Ulid::new()).await;
    customer
        .batch_execute(&book_sql(Ulid::new(), &salon, &date, "09:00"))
        .await
        .unwrap();

    let master = salon.master.to_string();
    let slots = customer
        .query(
            "SELECT * FROM slots WHERE master_id = $1 AND \"date\" = $2 AND duration = $3",
            &[&master, &date, &"60"],
        )
        .await
        .unwrap();
    let times: Vec<String> = slots.iter().map(|row| row.get("time")).collect();
    assert_eq!(times.first().map(String::as_str), Some("10:00"));
    assert_eq!(times.last().map(String::as_str), Some("17:00"));
    assert!(!times.contains(&"09:00".to_string()));
}

#[tokio::test]
async fn stats_follow_bookings() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;
    let date = tomorrow();

    let customer = connect(server.addr, Ulid::new()).await;
    for time in ["14:00", "15:00"] {
        customer
            .batch_execute(&book_sql(Ulid::new(), &salon, &date, time))
            .await
            .unwrap();
    }

    let stats = rows(&customer, "SELECT * FROM booking_stats").await;
    assert_eq!(stats[0].get("total"), Some("2"));
    assert_eq!(stats[0].get("pending"), Some("2"));
    assert_eq!(stats[0].get("active"), Some("2"));

    let overview = rows(&admin, "SELECT * FROM admin_stats").await;
    assert_eq!(overview[0].get("pending_bookings"), Some("2"));
    assert_eq!(overview[0].get("total_revenue"), Some("0"));
}

#[tokio::test]
async fn malformed_time_is_datetime_format_error() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let salon = open_salon(&admin).await;

    let customer = connect(server.addr, Ulid::new()).await;
    let err = customer
        .batch_execute(&book_sql(Ulid::new(), &salon, &tomorrow(), "9:30"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22007"));
}

#[tokio::test]
async fn login_requires_ulid_user() {
    let server = start_test_server().await;
    assert!(try_connect(server.addr, "alice").await.is_err());
}

#[tokio::test]
async fn master_upsert_takes_named_columns_and_rating() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;

    let (anna, oleg) = (Ulid::new(), Ulid::new());
    admin
        .batch_execute(&format!(
            "INSERT INTO masters (name, id, rating) VALUES ('Anna', '{anna}', 3.5)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO masters (id, name, experience_years) VALUES ('{oleg}', 'Oleg', 2)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO masters (id, name, rating) VALUES ('{oleg}', 'Oleg', 4.9)"
        ))
        .await
        .unwrap();
    // No rating given: the stored one stays.
    admin
        .batch_execute(&format!(
            "INSERT INTO masters (id, name, bio) VALUES ('{anna}', 'Anna', 'Colorist')"
        ))
        .await
        .unwrap();

    let masters = rows(&admin, "SELECT * FROM masters").await;
    let names: Vec<&str> = masters.iter().filter_map(|m| m.get("name")).collect();
    assert_eq!(names, ["Oleg", "Anna"]);
    assert_eq!(masters[1].get("bio"), Some("Colorist"));
    let rating = masters[1].get("rating").and_then(|r| r.parse::<f64>().ok());
    assert_eq!(rating, Some(3.5));

    let err = admin
        .batch_execute(&format!(
            "INSERT INTO masters (id, name, salary) VALUES ('{}', 'Ivan', 10)",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}
