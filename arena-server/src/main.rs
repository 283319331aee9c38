mod abuse;
mod config;
mod friends;
mod geom;
mod identity;
mod input;
mod lobby;
mod map;
mod party;
mod reconnect;
mod results;
mod rewards;
mod room;
mod session;
mod sim;
mod socket;
mod state;
mod sync;
mod telemetry;
mod transport;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use protocol::ServerEvent;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::abuse::{AuditLog, AuditRecord, AuditStream, run_audit_writer};
use crate::config::ServerConfig;
use crate::identity::{IdentityStore, InMemoryIdentityStore};
use crate::state::AppState;
use crate::telemetry::Telemetry;
use crate::util::now_ms;

/// Cadence of the keep-alive broadcast to every live connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the dead-connection sweep and store pruning.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
/// Activates tracing, builds the shared state, spawns the tick driver plus
/// heartbeat and watchdog tasks, then serves the WebSocket and telemetry
/// routes until a shutdown signal arrives. The audit writer is drained last.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = ServerConfig::from_env();
    let port = config.port;
    let (audit, audit_rx) = AuditLog::new();
    let audit_task = tokio::spawn(run_audit_writer(audit_rx, config.data_dir.clone()));
    let identity: Arc<dyn IdentityStore> = Arc::new(InMemoryIdentityStore::default());
    let app = Arc::new(AppState::new(config, identity, audit));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(tick_driver(app.clone(), shutdown_rx.clone()));
    tokio::spawn(heartbeat_driver(app.clone(), shutdown_rx.clone()));
    tokio::spawn(watchdog(app.clone(), shutdown_rx));

    let router = Router::new()
        .route("/ws", get(socket::websocket_handler))
        .route("/telemetry", get(telemetry_handler))
        .with_state(app.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap();
    tracing::info!(port, "Server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    // Stop the background tasks, release the audit sender, drain the log.
    let _ = shutdown_tx.send(true);
    drop(app);
    if tokio::time::timeout(Duration::from_secs(5), audit_task).await.is_err() {
        tracing::warn!("Audit writer did not drain in time");
    }
    tracing::info!("Shutdown complete");
}

/// Resolves on SIGINT or, on unix, SIGTERM — orchestrators send the latter,
/// and the audit drain must run for both.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "Cannot listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Renders the suspicion counters as plain text, in the spirit of a status
/// page rather than a metrics endpoint.
async fn telemetry_handler(State(app): State<Arc<AppState>>) -> String {
    let rooms = app.rooms.lock().await;
    let mut page = app.telemetry.render(&rooms, app.transport.count());
    page.push_str(&format!("pending results: {}\n", app.results.len()));
    page.push_str(&format!("buffered strike records: {}\n", app.audit.recent().len()));
    page
}

/// The single global tick loop: every room, every tick.
async fn tick_driver(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let interval_ms = app.config.tick_interval_ms();
    let dt_secs = interval_ms as f64 / 1_000.0;
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        run_tick(&app, now_ms(), dt_secs).await;
    }
    tracing::info!("Tick driver stopped");
}

/// One pass over all rooms, then the match-end bookkeeping outside the lock.
async fn run_tick(app: &AppState, now: u64, dt_secs: f64) {
    let mut ended = Vec::new();
    {
        let mut rooms = app.rooms.lock().await;
        let mut out = Vec::new();
        for room in rooms.iter_mut() {
            let end = sim::step_room(room, &app.maps, &app.config, now, dt_secs, &mut out);
            let conns = sim::room_conns(room);
            for event in out.drain(..) {
                app.transport.broadcast(conns.iter().copied(), &event);
            }
            if let Some(end) = end {
                ended.push(end);
            }
        }
        // Membership invariant: an emptied room does not survive the tick.
        for code in rooms.empty_room_codes() {
            rooms.remove(&code);
            let cancelled = app.invites.invalidate_room(&code);
            party::notify_invites_expired(app, &cancelled);
            tracing::info!(room = %code, "Empty room removed");
        }
    }
    for end in ended {
        handle_match_end(app, end, now);
    }
}

/// Persists results, restores reward flags and archives the room snapshot.
fn handle_match_end(app: &AppState, end: sim::MatchEnd, now: u64) {
    app.results
        .store_match(&end.room_code, &end.participants, end.results.clone(), end.ended_at_ms);
    for pid in &end.reward_restores {
        let flag = app.rewards.set_pending(pid, true, now);
        app.transport.send_to_pid(
            pid,
            &ServerEvent::AdsStateEvent(protocol::events::AdsState {
                instant_respawn_pending: flag.instant_respawn_pending,
                updated_at: flag.updated_at_ms,
            }),
        );
    }
    app.audit.append(AuditRecord {
        ts: now,
        stream: AuditStream::RoomSnapshots,
        reason: "match_end".into(),
        room: Some(end.room_code.clone()),
        conn_id: None,
        player_id: None,
        name: None,
        details: serde_json::json!({
            "results": end.results,
            "suspicionEvents": end.suspicion_total,
        }),
    });
    Telemetry::bump(&app.telemetry.matches_finished_total);
    tracing::info!(room = %end.room_code, "Match finished");
}

/// Keeps NAT bindings warm and lets clients estimate drift.
async fn heartbeat_driver(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        app.transport
            .broadcast(app.transport.all_conn_ids(), &ServerEvent::Heartbeat { t: now_ms() });
    }
}

/// Runs over all connections and side tables and cleans up what died quietly.
/// This is a fallback; things should be handled by the disconnect path
/// otherwise.
async fn watchdog(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = now_ms();
        for (conn_id, meta) in app.transport.sweep_closed() {
            tracing::info!(conn_id, "Removing dead connection");
            if let Some(room_code) = meta.room_code {
                lobby::handle_disconnect(&app, &room_code, conn_id).await;
            }
        }
        let expired = app.invites.prune_expired(now);
        party::notify_invites_expired(&app, &expired);
        app.reconnect.prune(now);
        app.results.prune(now);
        app.sessions.prune(now);
        app.ip_limits.prune(600_000, now);
        app.pid_limits.prune(600_000, now);
    }
}
