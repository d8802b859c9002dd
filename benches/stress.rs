use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16, club: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(club)
        .user(user)
        .password(std::env::var("TABLETIME_PASSWORD").unwrap_or_else(|_| "tabletime".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

async fn connect_admin(host: &str, port: u16, club: &str) -> tokio_postgres::Client {
    let client = connect(host, port, club, "bench_admin").await;
    client.batch_execute("SET ROLE admin").await.unwrap();
    client
}

fn new_club() -> String {
    format!("bench_{}", Ulid::new())
}

/// Start of a whole hour a month from now, well clear of lead times.
fn base_time() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    (now / HOUR + 30 * 24) * HOUR
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn booking_sql(start: i64, coach: &str) -> String {
    format!(
        r#"INSERT INTO bookings VALUES ({start}, {}, '{coach}')"#,
        start + HOUR
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect_admin(host, port, &new_club()).await;
    let base = base_time();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(base + (i as i64) * HOUR, "C1"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task races for the same coach and the same hours in one club.
/// Exactly one booking per hour may win.
async fn phase2_contention(host: &str, port: u16) {
    let n_tasks = 10;
    let n_hours = 200;
    let club = new_club();
    let base = base_time();

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let club = club.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect_admin(&host, port, &club).await;
            for h in 0..n_hours {
                match client.batch_execute(&booking_sql(base + h * HOUR, "C1")).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().is_some_and(|c| c.code() == "23P01") => {
                        lost.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_hours} contested hours in {:.2}s: {won} booked, {lost} conflicts",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_hours as usize, "each hour must be booked exactly once");
}

async fn phase3_slots_under_load(host: &str, port: u16) {
    let club = new_club();
    let base = base_time();
    let day = chrono::DateTime::from_timestamp_millis(base + DAY)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap();

    // Pre-fill a busy day
    let setup_client = connect_admin(host, port, &club).await;
    for c in 0..20 {
        setup_client
            .batch_execute(&booking_sql(base + DAY + (c % 10) * HOUR, &format!("C{c}")))
            .await
            .unwrap();
    }
    drop(setup_client);

    // Writers keep adding bookings on later days in the same club
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let club = club.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect_admin(&host, port, &club).await;
            let coach = format!("W{w}");
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&booking_sql(base + 2 * DAY + i * HOUR, &coach))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let club = club.clone();
        let day = day.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &club, &format!("player{r}")).await;
            let sql = if r % 2 == 0 {
                format!("SELECT * FROM slots WHERE day = '{day}'")
            } else {
                format!("SELECT * FROM slots WHERE day = '{day}' AND coach_id = 'C{r}'")
            };
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
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

    print_latency("slot query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let base = base_time();

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect_admin(&host, port, &new_club()).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&booking_sql(base + i * HOUR, "C1"))
                    .await
                    .unwrap();
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
    let host = std::env::var("TABLETIME_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TABLETIME_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid TABLETIME_PORT");

    println!("=== tabletime stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own club (unique dbname) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings for one coach");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] slot query latency under write load");
    phase3_slots_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
