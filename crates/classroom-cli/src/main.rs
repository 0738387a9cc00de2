//! Classroom session simulator
//!
//! Runs a teacher and a student in one process over the in-memory relay, the
//! loopback transport and mock capture devices. The link can be severed after
//! a delay, optionally with reconnects blocked, to watch recovery play out.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use classroom_core::access::InMemoryClassroomBackend;
use classroom_core::events::{ClassroomEventHandler, EventSubscription};
use classroom_core::logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
use classroom_core::media::{MediaStreamHandle, MemoryPreferenceStore, MockMediaSource, StopReason};
use classroom_core::{
    ClassroomConfig, ClassroomDeps, ClassroomSession, ConnectionState, ErrorKind, EventEmitter, InMemoryRelay,
    JoinRequest, LoopbackNetwork, QualitySample, RecoveryState, Role, SessionId,
};

const TEACHER_ID: &str = "teacher-1";
const STUDENT_ID: &str = "student-1";

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate a one-to-one classroom session", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Session to simulate
    #[arg(long, default_value = "demo-lesson")]
    session_id: String,

    /// Sever the peer link after this many seconds
    #[arg(long)]
    sever_after_secs: Option<u64>,

    /// Keep the network down after severing so recovery gives up
    #[arg(long)]
    block_reconnect: bool,

    /// How long to run before both participants leave
    #[arg(long, default_value = "30")]
    duration_secs: u64,
}

/// Prints every event of one participant
struct Printer {
    role: Role,
}

#[async_trait]
impl ClassroomEventHandler for Printer {
    async fn on_remote_stream(&self, _session_id: &SessionId, stream: MediaStreamHandle) {
        println!("[{}] remote stream {} {:?}", self.role, stream.id(), stream.track_kinds());
    }

    async fn on_connection_state_change(&self, _session_id: &SessionId, previous: ConnectionState, state: ConnectionState) {
        println!("[{}] connection {} -> {}", self.role, previous, state);
    }

    async fn on_error(&self, _session_id: &SessionId, kind: ErrorKind, message: &str) {
        println!("[{}] {} error: {}", self.role, kind, message);
    }

    async fn on_quality_change(&self, _session_id: &SessionId, sample: &QualitySample) {
        println!(
            "[{}] quality {} (loss {:.2}%, rtt {:.0} ms, jitter {:.0} ms)",
            self.role, sample.tier, sample.packet_loss_percent, sample.round_trip_latency_ms, sample.jitter_ms
        );
    }

    async fn on_recovery_state_change(&self, _session_id: &SessionId, state: &RecoveryState) {
        println!("[{}] recovery {}", self.role, state.banner());
    }

    async fn on_screen_share_state_change(&self, _session_id: &SessionId, is_sharing: bool, reason: Option<StopReason>) {
        println!("[{}] screen share {} {:?}", self.role, if is_sharing { "on" } else { "off" }, reason);
    }
}

struct Simulation {
    config: ClassroomConfig,
    session_id: String,
    backend: InMemoryClassroomBackend,
    relay: InMemoryRelay,
    net: LoopbackNetwork,
}

impl Simulation {
    async fn join(&self, participant: &str, role: Role) -> anyhow::Result<ClassroomSession> {
        let emitter = Arc::new(EventEmitter::new());
        emitter.subscribe(EventSubscription::all_events(Arc::new(Printer { role })));

        let deps = ClassroomDeps {
            validator: Arc::new(self.backend.clone()),
            telemetry: Arc::new(self.backend.clone()),
            media: Arc::new(MockMediaSource::new()),
            preferences: Arc::new(MemoryPreferenceStore::new()),
            relay: Arc::new(self.relay.clone()),
            transports: Arc::new(self.net.factory()),
            emitter,
        };
        let request = JoinRequest::new(self.session_id.as_str(), participant, role);
        ClassroomSession::join(&self.config, deps, request)
            .await
            .with_context(|| format!("{} failed to join", role))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ClassroomConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let mut logging = LoggingConfig::from_settings(&config.logging, "classroom-sim")?;
    if let Some(level) = &args.log_level {
        logging.level = parse_log_level(level)?;
    }
    if args.json_logs {
        logging = logging.with_json();
    }
    setup_logging(&logging)?;
    log_welcome("classroom-sim", env!("CARGO_PKG_VERSION"));

    let simulation = Simulation {
        config,
        session_id: args.session_id.clone(),
        backend: InMemoryClassroomBackend::new(),
        relay: InMemoryRelay::new(),
        net: LoopbackNetwork::new(),
    };
    simulation
        .backend
        .schedule_lesson(&args.session_id, TEACHER_ID, STUDENT_ID);

    // the relay only delivers to current subscribers, so the student listens first
    let student = simulation.join(STUDENT_ID, Role::Student).await?;
    let teacher = simulation.join(TEACHER_ID, Role::Teacher).await?;
    info!("Both participants joined {}", args.session_id);

    if let Some(after) = args.sever_after_secs {
        let net = simulation.net.clone();
        let block = args.block_reconnect;
        tokio::spawn(async move {
            sleep(Duration::from_secs(after)).await;
            if block {
                net.set_blocked(true);
            }
            let severed = net.sever();
            warn!("Severed {} endpoints (reconnects blocked: {})", severed, block);
        });
    }

    tokio::select! {
        _ = sleep(Duration::from_secs(args.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    for (role, session) in [(Role::Teacher, &teacher), (Role::Student, &student)] {
        let quality = session
            .latest_quality()
            .map(|q| q.tier.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "[{}] final: connection {}, recovery {}, quality {}",
            role,
            session.connection_state(),
            session.recovery_state().banner(),
            quality
        );
    }

    teacher.leave().await?;
    student.leave().await?;
    info!("Simulation finished");
    Ok(())
}
