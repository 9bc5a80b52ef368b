//! sharkwatch-sim - demo client for a running sharkwatch instance
//!
//! Seeds the Sydney beach zones, opens a push session subscribed to them and
//! then plays a drone patrol that reports detections over HTTP. Every line
//! pushed back over the session is printed as it arrives.
//!
//! Usage:
//!   cargo run --bin sharkwatch-sim
//!   cargo run --bin sharkwatch-sim -- --count 20 --interval-ms 250
//!   cargo run --bin sharkwatch-sim -- --api http://10.0.0.5:8080 --no-seed

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

// ============================================================================
// Seed data
// ============================================================================

struct Beach {
    name: &'static str,
    latitude: f64,
    longitude: f64,
    radius: f64,
    alert_level: &'static str,
}

const BEACHES: [Beach; 5] = [
    Beach { name: "Bondi Beach", latitude: -33.8915, longitude: 151.2767, radius: 500.0, alert_level: "high" },
    Beach { name: "Manly Beach", latitude: -33.7969, longitude: 151.2843, radius: 600.0, alert_level: "medium" },
    Beach { name: "Cronulla Beach", latitude: -34.0544, longitude: 151.1556, radius: 400.0, alert_level: "medium" },
    Beach { name: "Coogee Beach", latitude: -33.9209, longitude: 151.2603, radius: 450.0, alert_level: "medium" },
    Beach { name: "Maroubra Beach", latitude: -33.9500, longitude: 151.2594, radius: 550.0, alert_level: "low" },
];

const DRONES: [&str; 4] = ["DRONE-001", "DRONE-002", "DRONE-003", "DRONE-004"];

const SPECIES: [&str; 5] = ["Great White", "Tiger", "Bull", "Hammerhead", "Mako"];

const SIZES: [&str; 3] = ["small", "medium", "large"];

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "sharkwatch-sim")]
#[command(about = "sharkwatch demo client - seeds zones and reports detections")]
struct Args {
    /// Base URL of the HTTP API
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Push session address (host:port)
    #[arg(long, default_value = "127.0.0.1:8090")]
    sessions: String,

    /// Subscriber id used for the push session
    #[arg(long, default_value = "sim-lifeguard")]
    subscriber: String,

    /// Number of detections to report
    #[arg(long, default_value_t = 10)]
    count: usize,

    /// Delay between detections
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Skip zone seeding and use the zones already registered
    #[arg(long)]
    no_seed: bool,
}

// ============================================================================
// HTTP helpers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneSummary {
    id: u64,
    name: String,
    is_active: bool,
}

async fn seed_zones(client: &reqwest::Client, api: &str) -> anyhow::Result<()> {
    for beach in &BEACHES {
        let body = json!({
            "name": beach.name,
            "latitude": beach.latitude,
            "longitude": beach.longitude,
            "radius": beach.radius,
            "alertLevel": beach.alert_level,
        });
        let resp = client
            .post(format!("{}/api/geofences", api))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to create zone {}", beach.name))?;

        if resp.status().is_success() {
            println!("+ zone {}", beach.name);
        } else {
            println!("! zone {} rejected: {}", beach.name, resp.status());
        }
    }
    Ok(())
}

async fn active_zones(client: &reqwest::Client, api: &str) -> anyhow::Result<Vec<ZoneSummary>> {
    let zones: Vec<ZoneSummary> = client
        .get(format!("{}/api/geofences", api))
        .send()
        .await
        .context("Failed to list zones")?
        .error_for_status()?
        .json()
        .await
        .context("Invalid zone list")?;
    Ok(zones.into_iter().filter(|z| z.is_active).collect())
}

async fn store_subscriptions(
    client: &reqwest::Client,
    api: &str,
    subscriber: &str,
    zones: &[ZoneSummary],
) -> anyhow::Result<()> {
    let ids: Vec<u64> = zones.iter().map(|z| z.id).collect();
    client
        .put(format!("{}/api/notifications/device/{}/subscriptions", api, subscriber))
        .json(&json!({ "zoneIds": ids }))
        .send()
        .await
        .context("Failed to store subscriptions")?
        .error_for_status()?;
    Ok(())
}

/// Detection `n` of the patrol: cycles through beaches, drones and species,
/// drifting a little off the beach centre so some land outside every zone.
fn detection_body(n: usize) -> Value {
    let beach = &BEACHES[n % BEACHES.len()];
    let drift = ((n % 7) as f64 - 3.0) * 0.0015;
    let confidence = 55.0 + ((n * 37) % 45) as f64;

    json!({
        "detectionId": format!("sim-{}-{}", std::process::id(), n),
        "latitude": beach.latitude + drift,
        "longitude": beach.longitude - drift,
        "sharkType": SPECIES[n % SPECIES.len()],
        "confidence": confidence,
        "droneName": DRONES[n % DRONES.len()],
        "size": SIZES[n % SIZES.len()],
    })
}

// ============================================================================
// Push session
// ============================================================================

/// Open a push session, bind it to `subscriber` and print every pushed line
async fn run_session(addr: String, subscriber: String) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to session listener {}", addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    match lines.next_line().await? {
        Some(line) if line.starts_with("OK READY") => println!("< {}", line),
        Some(line) => bail!("unexpected greeting: {}", line),
        None => bail!("session closed before greeting"),
    }

    writer.write_all(format!("HELLO {}\n", subscriber).as_bytes()).await?;

    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<Value>(&line) {
            Ok(msg) => println!(
                "< {} zone={} level={} {}",
                msg["title"].as_str().unwrap_or("?"),
                msg["zoneId"],
                msg["alertLevel"].as_str().unwrap_or("?"),
                msg["body"].as_str().unwrap_or(""),
            ),
            Err(_) => println!("< {}", line),
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let api = args.api.trim_end_matches('/').to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    if !args.no_seed {
        seed_zones(&client, &api).await?;
    }

    let zones = active_zones(&client, &api).await?;
    println!("{} active zones: {}", zones.len(), zones.iter().map(|z| z.name.as_str()).collect::<Vec<_>>().join(", "));
    store_subscriptions(&client, &api, &args.subscriber, &zones).await?;

    let session = tokio::spawn(run_session(args.sessions.clone(), args.subscriber.clone()));
    // Let HELLO land before the first report
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut published = 0usize;
    for n in 0..args.count {
        let body = detection_body(n);
        let resp = client.post(format!("{}/api/sharks/report", api)).json(&body).send().await;
        match resp {
            Ok(resp) if resp.status().is_success() => {
                let receipt: Value = resp.json().await.unwrap_or(Value::Null);
                let delivered = receipt["deliveredCount"].as_u64().unwrap_or(0);
                if delivered > 0 {
                    published += 1;
                }
                println!(
                    "> {} {} conf={} level={} delivered={}",
                    body["droneName"].as_str().unwrap_or("?"),
                    body["sharkType"].as_str().unwrap_or("?"),
                    body["confidence"],
                    receipt["alertLevel"].as_str().unwrap_or("?"),
                    delivered,
                );
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                println!("> report rejected: {} {}", status, text);
            }
            Err(e) => println!("> report error: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    println!("{} of {} detections fanned out", published, args.count);

    // Drain pushes still in flight, then stop
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.abort();
    Ok(())
}
