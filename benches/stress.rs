use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Duration as Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, user: &str) -> Client {
    let password = std::env::var("PTSCHED_PASSWORD").unwrap_or_else(|_| "ptsched".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("ptsched")
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Far enough out that reruns against a persistent server rarely collide.
fn day(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap() + Days::days(i as i64)
}

/// Whether a booking INSERT came back with `ok = t`.
async fn book(client: &Client, sql: &str) -> bool {
    let messages = client.simple_query(sql).await.unwrap();
    messages.iter().any(|m| match m {
        SimpleQueryMessage::Row(row) => row.get("ok") == Some("t"),
        _ => false,
    })
}

/// A fresh trainer with an every-day 06:00-22:00 block and a 60-minute open
/// product. Returns (trainer, template, product).
async fn setup_trainer(admin: &Client) -> (String, Ulid, Ulid) {
    let trainer = format!("bench-{}", Ulid::new());
    let template = Ulid::new();
    let product = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO availability_templates (id, trainer, days_of_week, start_time, end_time)
                 VALUES ('{template}', '{trainer}', '0,1,2,3,4,5,6', '06:00', '22:00');
             INSERT INTO session_products (id, trainer, duration) VALUES ('{product}', '{trainer}', 60)"
        ))
        .await
        .unwrap();
    (trainer, template, product)
}

async fn setup_members(admin: &Client, n: usize) -> Vec<String> {
    let run = Ulid::new();
    let mut members = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("bench-{run}-{i}");
        admin
            .batch_execute(&format!(
                "INSERT INTO members (id) VALUES ('{id}');
                 INSERT INTO credit_ledger (member_id, duration, amount) VALUES ('{id}', 60, 1000)"
            ))
            .await
            .unwrap();
        members.push(id);
    }
    println!("  created {n} members");
    members
}

fn open_insert(product: Ulid, date: NaiveDate, start: &str, member: &str) -> String {
    format!(
        "INSERT INTO open_bookings (id, product_id, date, start_time, member_id, payment)
         VALUES ('{}', '{product}', '{date}', '{start}', '{member}', 'paid')",
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16, member: &str) {
    let client = connect(host, port, "admin").await;
    let (_, _, product) = setup_trainer(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    let mut ok = 0;

    for i in 0..n {
        // Three sessions a day, well clear of the buffer.
        let start_time = ["08:00", "12:00", "16:00"][i % 3];
        let t = Instant::now();
        if book(&client, &open_insert(product, day(i / 3), start_time, member)).await {
            ok += 1;
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {ok}/{n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("commit latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16, members: &[String]) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let member = members[i % members.len()].clone();

        handles.push(tokio::spawn(async move {
            // Each task books its own trainer, so partitions never contend.
            let client = connect(&host, port, "admin").await;
            let (_, template, _) = setup_trainer(&client).await;
            let mut ok = 0;
            for j in 0..n_per_task {
                let sql = format!(
                    "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id, payment)
                     VALUES ('{}', '{template}', '{}', '09:00', 60, '{member}', 'paid')",
                    Ulid::new(),
                    day(j)
                );
                if book(&client, &sql).await {
                    ok += 1;
                }
            }
            ok
        }));
    }

    let mut ok = 0;
    for h in handles {
        ok += h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {ok}/{total} committed in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended(host: &str, port: u16, members: &[String]) {
    let admin = connect(host, port, "admin").await;
    let (_, template, _) = setup_trainer(&admin).await;
    drop(admin);

    let n_tasks = 16;
    let n_dates = 100;
    let winners = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let member = members[i % members.len()].clone();
        let winners = winners.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("member:{member}")).await;
            for d in 0..n_dates {
                let sql = format!(
                    "INSERT INTO block_bookings (id, template_id, date, start_time, duration, member_id)
                     VALUES ('{}', '{template}', '{}', '10:00', 60, '{member}')",
                    Ulid::new(),
                    day(d)
                );
                if book(&client, &sql).await {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = winners.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} members racing for {n_dates} starts: {won} winners in {:.2}s{}",
        start.elapsed().as_secs_f64(),
        if won == n_dates { "" } else { "  ** DOUBLE BOOKING **" }
    );
}

async fn phase4_read_under_load(host: &str, port: u16, members: &[String]) {
    let admin = connect(host, port, "admin").await;
    let (trainer, _, product) = setup_trainer(&admin).await;
    for i in 0..50 {
        book(&admin, &open_insert(product, day(i % 7), ["08:00", "12:00", "16:00"][i % 3], &members[0])).await;
    }
    drop(admin);

    // Writers keep committing to their own trainers in the background.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        let member = members[w % members.len()].clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "admin").await;
            let (_, _, product) = setup_trainer(&client).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let start_time = ["08:00", "12:00", "16:00"][i % 3];
                book(&client, &open_insert(product, day(i / 3), start_time, &member)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let trainer = trainer.clone();
        let member = members[r % members.len()].clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("member:{member}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM blocks WHERE trainer = '{trainer}' AND date >= '{}' AND date <= '{}'",
                        day(0),
                        day(6)
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("week of blocks", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16, members: &[String]) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        let member = members[c % members.len()].clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "admin").await;
            let (_, _, product) = setup_trainer(&client).await;
            for i in 0..ops_per_conn {
                book(&client, &open_insert(product, day(i), "10:00", &member)).await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PTSCHED_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PTSCHED_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid PTSCHED_PORT");

    println!("=== ptsched stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let admin = connect(&host, port, "admin").await;
    let members = setup_members(&admin, 16).await;
    drop(admin);

    println!("\n[phase 1] sequential commit throughput");
    phase1_sequential(&host, port, &members[0]).await;

    println!("\n[phase 2] concurrent commits, disjoint trainers");
    phase2_concurrent(&host, port, &members).await;

    println!("\n[phase 3] contended commits, one block start per date");
    phase3_contended(&host, port, &members).await;

    println!("\n[phase 4] availability reads under write load");
    phase4_read_under_load(&host, port, &members).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port, &members).await;

    println!("\n=== benchmark complete ===");
}
