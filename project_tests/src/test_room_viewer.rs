use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use lib_common::RoomView;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Watches live room updates from server_rooms", long_about = None)]
struct Args {
    /// Base WebSocket URL of the server
    #[clap(long, default_value = "ws://127.0.0.1:9010/ws")]
    url: String,

    /// Watch a single room
    #[clap(long, conflicts_with_all = ["branch_id", "device_id"])]
    room_id: Option<i64>,

    /// Watch every room of a branch
    #[clap(long, conflicts_with = "device_id")]
    branch_id: Option<i64>,

    /// Watch the room linked to a device (needs --user-id)
    #[clap(long, requires = "user_id")]
    device_id: Option<i64>,

    /// Owner of the device
    #[clap(long, requires = "device_id")]
    user_id: Option<i64>,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

impl Args {
    fn endpoint(&self) -> String {
        match (self.room_id, self.branch_id, self.device_id, self.user_id) {
            (Some(room), _, _, _) => format!("{}?roomId={room}", self.url),
            (_, Some(branch), _, _) => format!("{}?branchId={branch}", self.url),
            (_, _, Some(device), Some(user)) => format!("{}?deviceId={device}&userId={user}", self.url),
            _ => self.url.clone(),
        }
    }
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    room_timestamps: HashMap<i64, VecDeque<chrono::DateTime<Utc>>>,
}

impl Stats {
    fn record(&mut self, room_id: i64) {
        let now = Utc::now();
        self.global_timestamps.push_back(now);
        self.room_timestamps.entry(room_id).or_default().push_back(now);
    }

    /// Drops entries older than `window` and returns the global rate plus
    /// per-room rates, busiest first.
    fn rates(&mut self, window: Duration) -> (usize, Vec<(i64, usize)>) {
        let cutoff = Utc::now() - window;
        while self.global_timestamps.front().is_some_and(|&t| t < cutoff) {
            self.global_timestamps.pop_front();
        }
        let mut rates = Vec::new();
        for (room, dq) in self.room_timestamps.iter_mut() {
            while dq.front().is_some_and(|&t| t < cutoff) {
                dq.pop_front();
            }
            if !dq.is_empty() {
                rates.push((*room, dq.len()));
            }
        }
        rates.sort_by(|a, b| b.1.cmp(&a.1));
        (self.global_timestamps.len(), rates)
    }
}

fn describe(view: &RoomView) -> String {
    match &view.session {
        Some(session) => format!(
            "room {} [{}] {:?} elapsed={}s remaining={}s",
            view.room_id,
            view.name,
            session.status,
            view.elapsed_billable_seconds.unwrap_or(0),
            view.remaining_seconds.unwrap_or(0),
        ),
        None => format!("room {} [{}] idle", view.room_id, view.name),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let interval = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(interval)).await;
            let (global_rate, rates) = stats_reporter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .rates(Duration::seconds(interval as i64));

            let report = rates
                .iter()
                .map(|(room, count)| format!("room {room}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- {interval}s Summary -----");
            println!("Global: {global_rate} updates");
            println!("Rooms: {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    let endpoint = args.endpoint();
    println!("Connecting to {endpoint}...");
    let (ws_stream, _) = connect_async(endpoint.as_str())
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    while let Some(msg) = read.next().await {
        match msg.context("reading from server")? {
            Message::Text(text) => match serde_json::from_str::<RoomView>(&text) {
                Ok(view) => {
                    println!("{} {}", view.generated_at.format("%H:%M:%S"), describe(&view));
                    stats
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(view.room_id);
                }
                Err(e) => eprintln!("Unparseable message: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    println!("Server closed the connection.");
    Ok(())
}
