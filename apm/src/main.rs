//! # apm-demo - Demo Entry Point
//!
//! Runs synthetic request and background workers under the agent, harvests
//! on a timer into the logging loopback collector, and performs a final
//! shutdown harvest on exit. Use `RUST_LOG=info` (or `debug` for payloads).

// Worker timings are synthetic; precision loss in the casts is irrelevant
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use apm::cli::Args;
use apm::domain::{now_secs, ThreadCategory};
use apm::loopback::LoopbackConnector;
use apm::stack::{self, ThreadRegistry};
use apm::Application;
use apm_common::{
    AgentCommandRequest, Configuration, ErrorRecord, Segment, Settings, SqlNode, TransactionData,
    TransactionGroup, ValueMetric,
};
use clap::Parser;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// Every Nth synthetic request fails
const ERROR_EVERY: u64 = 17;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path).context("Failed to load agent settings")?,
        None => Settings::default(),
    };
    if let Some(name) = &args.app_name {
        settings.app_name.clone_from(name);
    }
    if let Some(interval) = args.harvest_interval {
        settings.harvest_interval = interval;
    }
    Ok(settings)
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;

    let connector = LoopbackConnector::new(Configuration::default());
    if args.profile > 0 {
        connector.queue_command(AgentCommandRequest {
            id: 1,
            name: "start_profiler".to_string(),
            arguments: serde_json::json!({
                "profile_id": 1,
                "sample_period": 0.1,
                "duration": args.profile,
                "profile_agent_code": false,
            }),
        });
    }

    let app = Arc::new(Application::new(
        settings.clone(),
        Arc::new(connector),
        ThreadRegistry::global(),
    ));
    app.activate_session();

    let startup_timeout = Duration::try_from_secs_f64(settings.startup_timeout).unwrap_or_default();
    if !startup_timeout.is_zero() && !app.wait_for_session_activation(startup_timeout) {
        info!("Continuing without a collector session after {startup_timeout:?}");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let workers = spawn_workers(args.workers, &app, &stop)?;
    info!("Started {} workers for {:?}", workers.len(), app.name());

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

    let mut harvest_timer =
        tokio::time::interval(Duration::from_secs(settings.harvest_interval.max(1)));
    // The first tick completes immediately; nothing has been recorded yet
    harvest_timer.tick().await;

    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        tokio::select! {
            _ = harvest_timer.tick() => {
                harvest(&app, false).await?;
            }
            () = tokio::time::sleep(Duration::from_millis(100)) => {
                // Continue loop
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().ok();
    }

    harvest(&app, true).await?;

    eprintln!("\n{exit_reason}: {:.1}s", started.elapsed().as_secs_f64());
    app.dump(&mut std::io::stderr().lock()).context("Failed to write status")?;
    Ok(())
}

/// Harvest on the blocking pool; session calls may block on I/O.
async fn harvest(app: &Arc<Application>, shutdown: bool) -> Result<()> {
    let app = Arc::clone(app);
    tokio::task::spawn_blocking(move || app.harvest(shutdown))
        .await
        .context("Harvest task panicked")
}

fn spawn_workers(
    count: usize,
    app: &Arc<Application>,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|index| {
            let app = Arc::clone(app);
            let stop = Arc::clone(stop);
            thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || run_worker(index, &app, &stop))
                .context("Failed to spawn worker thread")
        })
        .collect()
}

fn run_worker(index: usize, app: &Application, stop: &AtomicBool) {
    let (category, group) = if index % 2 == 0 {
        (ThreadCategory::Request, TransactionGroup::Web)
    } else {
        (ThreadCategory::Background, TransactionGroup::Other)
    };
    stack::register_current_thread(category);

    let mut request = 0u64;
    while !stop.load(Ordering::SeqCst) {
        request += 1;
        let _busy = app.thread_utilization().enter();
        let data = handle_request(index, request, group);

        let (name, ignored) = app.normalize_name(&data.name);
        if !ignored {
            app.record_transaction(&TransactionData { name, ..data });
        }
        app.record_metric("Custom/Worker/Requests", 1.0);

        thread::sleep(Duration::from_millis(20));
    }
}

/// Simulate one unit of work inside profiled scopes.
fn handle_request(index: usize, request: u64, group: TransactionGroup) -> TransactionData {
    let _scope = apm::profile_scope!("handle_request");
    let start_time = now_secs();

    let query_ms = 2 + (request * 7 + index as u64) % 18;
    let query_started = Instant::now();
    {
        let _query = apm::profile_scope!("query_orders");
        thread::sleep(Duration::from_millis(query_ms));
    }
    let query_time = query_started.elapsed().as_secs_f64();

    let render_started = Instant::now();
    {
        let _render = apm::profile_scope!("render");
        thread::sleep(Duration::from_millis(1));
    }
    let render_time = render_started.elapsed().as_secs_f64();

    let end_time = now_secs();
    let total = (end_time - start_time).max(query_time + render_time);

    let errors = if request % ERROR_EVERY == 0 {
        vec![ErrorRecord {
            kind: "TimeoutError".to_string(),
            message: format!("order lookup {request} timed out"),
            stack_trace: vec!["handle_request".to_string(), "query_orders".to_string()],
        }]
    } else {
        Vec::new()
    };

    TransactionData {
        name: format!("/orders/{}", request % 5),
        group,
        start_time,
        end_time: start_time + total,
        request_uri: Some(format!("/orders/{}?worker={index}", request % 5)),
        segments: vec![
            Segment {
                name: "Datastore/statement/Postgres/orders/select".to_string(),
                duration: query_time,
                exclusive: query_time,
            },
            Segment {
                name: "Function/render".to_string(),
                duration: render_time,
                exclusive: render_time,
            },
        ],
        errors,
        slow_sql: vec![SqlNode {
            sql: "SELECT * FROM orders WHERE id = ?".to_string(),
            metric: "Datastore/statement/Postgres/orders/select".to_string(),
            duration: query_time,
        }],
        custom_metrics: vec![ValueMetric::new("Custom/Orders/QueryMs", query_ms as f64)],
    }
}
