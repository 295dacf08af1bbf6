//! Pinwall simulator.
//!
//! Runs multi-client board scenarios against in-memory collaborators and
//! prints what each client ends up seeing.
//!
//! ## Usage
//!
//! ```bash
//! pinwall-sim lock-race --clients 3
//! pinwall-sim drag --x 315 --y 262
//! pinwall-sim agent --frames 4 --notes 9 --fail-after 10
//! pinwall-sim viewport --width 1000 --height 1000
//! pinwall-sim --config pinwall.toml drag
//! RUST_LOG=pinwall_sync=debug pinwall-sim agent
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use pinwall_sync::backend::memory::{
    MemoryCoordinationServer, MemoryCoordinationStore, MemoryDocumentStore, ScriptedToolService,
};
use pinwall_sync::{
    BoardSession, Collaborators, CreateSpec, GestureKind, PresenceIdentity, SharedClock,
    SyncConfig, SyncError, SystemClock, ToolCall, ToolStreamItem,
};
use pinwall_types::{BoardId, BoardObject, CommandId, Geometry, ObjectId, ObjectKind, Rect, UserId};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const PALETTE: [&str; 4] = ["#ef4444", "#3b82f6", "#22c55e", "#eab308"];

/// Simulate collaborating clients on one board.
#[derive(Parser, Debug)]
#[command(name = "pinwall-sim")]
#[command(about = "Run Pinwall board-sync scenarios in memory")]
struct Args {
    /// TOML file with SyncConfig overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Several clients try to lock the same object at once
    LockRace {
        #[arg(long, default_value_t = 2)]
        clients: usize,
    },
    /// One client drags a note while another watches
    Drag {
        #[arg(long, default_value_t = 315.0)]
        x: f64,
        #[arg(long, default_value_t = 262.0)]
        y: f64,
    },
    /// Run a scripted agent command, optionally failing after N writes
    Agent {
        #[arg(long, default_value_t = 4)]
        frames: usize,
        #[arg(long, default_value_t = 9)]
        notes: usize,
        /// Fail the durable write after this many successful ones
        #[arg(long)]
        fail_after: Option<u64>,
    },
    /// Scatter notes and list the ones a viewport at the origin culls in
    Viewport {
        #[arg(long, default_value_t = 1000.0)]
        width: f64,
        #[arg(long, default_value_t = 1000.0)]
        height: f64,
        #[arg(long, default_value_t = 40)]
        count: usize,
    },
}

/// One board with in-memory collaborators.
struct SimBoard {
    id: BoardId,
    docs: MemoryDocumentStore,
    server: MemoryCoordinationServer,
    tools: ScriptedToolService,
    config: SyncConfig,
    clock: SharedClock,
}

impl SimBoard {
    fn new(config: SyncConfig) -> Self {
        Self {
            id: BoardId::new("sim-board"),
            docs: MemoryDocumentStore::new(),
            server: MemoryCoordinationServer::new(config.disconnect_cleanup()),
            tools: ScriptedToolService::new(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    async fn join(
        &self,
        user: &str,
        slot: usize,
    ) -> Result<(BoardSession, MemoryCoordinationStore)> {
        let connection = self.server.connect();
        let identity = PresenceIdentity {
            user: UserId::new(user),
            display_name: user.to_string(),
            color: PALETTE[slot % PALETTE.len()].to_string(),
        };
        let collaborators = Collaborators {
            docs: Arc::new(self.docs.clone()),
            coord: Arc::new(connection.clone()),
            tools: Arc::new(self.tools.clone()),
        };
        let session = BoardSession::open(
            self.id.clone(),
            identity,
            collaborators,
            self.config.clone(),
            Arc::clone(&self.clock),
        )
        .await
        .with_context(|| format!("{user} failed to join"))?;
        for _ in 0..100 {
            if session.store().is_loaded() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        if !session.store().is_loaded() {
            bail!("{user} never finished the initial load");
        }
        Ok((session, connection))
    }
}

fn seed_note(board: &SimBoard, id: &ObjectId) {
    let geometry = Geometry::new(0.0, 0.0, 200.0, 200.0);
    board.docs.seed(&board.id, BoardObject::new(id.clone(), ObjectKind::Note, geometry));
}

/// Give background tasks a moment to deliver feed and coordination events.
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            SyncConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    config.validate()?;

    let board = SimBoard::new(config);
    match args.command {
        Command::LockRace { clients } => lock_race(&board, clients).await,
        Command::Drag { x, y } => drag(&board, x, y).await,
        Command::Agent { frames, notes, fail_after } => {
            agent(&board, frames, notes, fail_after).await
        }
        Command::Viewport { width, height, count } => {
            viewport(&board, width, height, count).await
        }
    }
}

async fn lock_race(board: &SimBoard, clients: usize) -> Result<()> {
    if clients < 2 {
        bail!("a race needs at least two clients");
    }
    let target = ObjectId::new("sticky-1");
    seed_note(board, &target);

    let mut sessions = Vec::with_capacity(clients);
    for i in 0..clients {
        sessions.push(board.join(&format!("user-{i}"), i).await?.0);
    }

    let results = join_all(sessions.iter().map(|s| s.locks().acquire(&target))).await;
    for (session, result) in sessions.iter().zip(&results) {
        match result {
            Ok(()) => println!("{:<8} acquired {target}", session.user().as_str()),
            Err(SyncError::LockContention { holder_name, .. }) => {
                println!("{:<8} contention (held by {holder_name})", session.user().as_str())
            }
            Err(err) => println!("{:<8} error: {err}", session.user().as_str()),
        }
    }
    let winners = results.iter().filter(|r| r.is_ok()).count();
    println!("winners: {winners}");

    for session in sessions {
        session.leave().await?;
    }
    if winners != 1 {
        bail!("expected exactly one lock holder, got {winners}");
    }
    Ok(())
}

async fn drag(board: &SimBoard, x: f64, y: f64) -> Result<()> {
    let target = ObjectId::new("sticky-1");
    seed_note(board, &target);
    let (dragger, _) = board.join("ada", 0).await?;
    let (watcher, _) = board.join("bob", 1).await?;

    let mut gesture = dragger.begin_gesture(GestureKind::Drag, &target).await?;
    let steps = 5;
    for i in 1..=steps {
        let t = i as f64 / steps as f64;
        gesture.update(Geometry::new(x * t, y * t, 200.0, 200.0))?;
    }
    let committed = gesture.end().await?;
    settle().await;

    let seen = watcher.store().get(&target).context("watcher lost the note")?;
    println!("raw      ({x}, {y})");
    let snapped = &committed.geometry;
    println!("snapped  ({}, {})  grid {}", snapped.x, snapped.y, board.config.grid_size);
    println!("watcher  ({}, {})  revision {}", seen.geometry.x, seen.geometry.y, seen.revision);

    dragger.leave().await?;
    watcher.leave().await?;
    Ok(())
}

async fn agent(
    board: &SimBoard,
    frames: usize,
    notes: usize,
    fail_after: Option<u64>,
) -> Result<()> {
    let (session, _) = board.join("ada", 0).await?;
    let (observer, _) = board.join("bob", 1).await?;

    let mut script = Vec::new();
    for f in 0..frames {
        script.push(ToolStreamItem::Operation(ToolCall::Create(
            CreateSpec::new(ObjectKind::Frame, 1000.0 * f as f64, 0.0, 900.0, 900.0)
                .with_ref(format!("frame-{f}"))
                .with_text(format!("Group {f}")),
        )));
    }
    for n in 0..notes {
        let mut spec = CreateSpec::new(ObjectKind::Note, 0.0, 0.0, 150.0, 150.0)
            .with_text(format!("idea {n}"));
        if frames > 0 {
            let f = n % frames;
            spec = spec.in_frame(format!("frame-{f}"));
            spec.x = 1000.0 * f as f64 + 50.0 + 170.0 * (n / frames) as f64;
            spec.y = 100.0;
        }
        script.push(ToolStreamItem::Operation(ToolCall::Create(spec)));
    }
    script.push(ToolStreamItem::Operation(ToolCall::QueryState));
    script.push(ToolStreamItem::Completed { summary: format!("{frames} frames, {notes} notes") });
    board.tools.push_script(script);
    if let Some(n) = fail_after {
        board.docs.fail_write_at(n + 1);
    }

    let command = CommandId::generate();
    let result = session
        .agent()
        .run_command(
            command.clone(),
            session.user(),
            "organize the board",
            CancellationToken::new(),
        )
        .await;
    settle().await;

    match result {
        Ok(report) => {
            println!(
                "command {} confirmed {} objects: {}",
                report.command_id, report.confirmed, report.summary
            );
            if let Some(state) = report.outcomes.iter().rev().find_map(|o| o.state.as_ref()) {
                println!("{}", serde_json::to_string_pretty(state)?);
            }
        }
        Err(SyncError::AgentCommand { message, outcomes, .. }) => {
            println!("command {command} rolled back after {} steps: {message}", outcomes.len());
        }
        Err(err) => return Err(err.into()),
    }
    println!(
        "durable {}  ada {}  bob {}  pending {}",
        board.docs.snapshot(&board.id).len(),
        session.store().len(),
        observer.store().len(),
        observer
            .store()
            .objects_with_command(&command)
            .iter()
            .filter(|o| o.is_ai_pending)
            .count(),
    );

    session.leave().await?;
    observer.leave().await?;
    Ok(())
}

async fn viewport(board: &SimBoard, width: f64, height: f64, count: usize) -> Result<()> {
    for i in 0..count {
        // Deterministic scatter over roughly twice the viewport.
        let x = ((i * 7919) % 2000) as f64 / 1000.0 * width;
        let y = ((i * 104_729) % 2000) as f64 / 1000.0 * height;
        let note = BoardObject::new(
            format!("note-{i}"),
            ObjectKind::Note,
            Geometry::new(x, y, 50.0, 50.0),
        );
        board.docs.seed(&board.id, note);
    }
    let (session, _) = board.join("ada", 0).await?;
    let visible = session.visible(&Rect::from_xywh(0.0, 0.0, width, height));
    println!(
        "{} of {} objects within {width}x{height} (+{} padding)",
        visible.len(),
        session.store().len(),
        board.config.viewport_padding
    );
    for object in &visible {
        let g = &object.geometry;
        println!("  {:<10} ({:>7.1}, {:>7.1})", object.id.as_str(), g.x, g.y);
    }
    session.leave().await?;
    Ok(())
}
