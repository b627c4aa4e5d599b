use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hornbeam::{
    catalog::{Catalog, CatalogDefinition},
    config::Settings,
    entity::{ChannelId, GuildId, UserId},
    node::Node,
    operator::{Command, Operator},
    sim::{LoopbackTransport, TransportEvent},
    stats::MemoryStatsStore,
    voice::VoiceStateCache,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hornbeam", about = "Plays short audio clips into voice channels")]
struct Cli {
    /// Settings file, merged under HORNBEAM_* environment variables
    #[arg(short, long, global = true, env = "HORNBEAM_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the catalog and list its collections
    Catalog,

    /// Play requests through an in-process transport and report what happened.
    /// With an owner configured, also answers the operator commands as that
    /// owner.
    Simulate {
        #[arg(long)]
        guild: GuildId,

        #[arg(long)]
        user: UserId,

        #[arg(long)]
        channel: ChannelId,

        #[arg(long)]
        collection: String,

        /// Play this clip instead of a weighted pick
        #[arg(long)]
        clip: Option<String>,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(run(cli))
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hornbeam=info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    let definition = CatalogDefinition::from_file(&settings.catalog_path)?;
    let catalog = Catalog::load(definition, &settings.audio_dir)?;

    match cli.command {
        Commands::Catalog => {
            print_catalog(&catalog);
            Ok(())
        }
        Commands::Simulate {
            guild,
            user,
            channel,
            collection,
            clip,
            count,
        } => simulate(settings, catalog, guild, user, channel, collection, clip, count).await,
    }
}

fn print_catalog(catalog: &Catalog) {
    for collection in catalog.collections() {
        let silent: Vec<_> = collection
            .clips
            .iter()
            .filter(|clip| clip.is_silent())
            .map(|clip| clip.name.as_str())
            .collect();
        let chain = collection
            .chain_with
            .as_deref()
            .map(|target| format!(" -> {target}"))
            .unwrap_or_default();
        println!(
            "{}{chain}: {} clips, total weight {}, silent [{}]",
            collection.id,
            collection.clips.len(),
            collection.total_weight(),
            silent.join(", "),
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn simulate(
    settings: Settings,
    catalog: Catalog,
    guild: GuildId,
    user: UserId,
    channel: ChannelId,
    collection: String,
    clip: Option<String>,
    count: usize,
) -> Result<()> {
    let states = Arc::new(VoiceStateCache::new());
    states.join(guild.clone(), user.clone(), channel);

    let transport = LoopbackTransport::new();
    let store = MemoryStatsStore::new();
    let node = Node::spawn(
        &settings,
        Arc::new(catalog),
        states,
        transport.clone(),
        Some(store.clone()),
    )?;

    for _ in 0..count {
        let admission = node
            .dispatcher()
            .request_play(&user, &guild, &collection, clip.as_deref())
            .await?;
        println!("request: {}", admission.as_str());
    }

    node.wait_until_idle(&guild).await?;
    node.shutdown().await;

    let mut summary: BTreeMap<&str, usize> = BTreeMap::new();
    let events = transport.events_for(&guild);
    for logged in &events {
        let kind = match &logged.event {
            TransportEvent::Open { .. } => "open",
            TransportEvent::Switch { .. } => "switch",
            TransportEvent::Speaking { speaking: true, .. } => "speaking_on",
            TransportEvent::Speaking { speaking: false, .. } => "speaking_off",
            TransportEvent::Frame { .. } => "frame",
            TransportEvent::Disconnect { .. } => "disconnect",
        };
        *summary.entry(kind).or_default() += 1;
    }
    let elapsed = match (events.first(), events.last()) {
        (Some(first), Some(last)) => last.at.duration_since(first.at),
        _ => Default::default(),
    };

    println!("transport ({elapsed:?}):");
    for (kind, n) in summary {
        println!("  {kind}: {n}");
    }
    println!("stats:");
    for (key, value) in store.counters() {
        println!("  {key} = {value}");
    }

    let Some(owner) = settings.owner.clone() else {
        println!("operator: no owner configured");
        return Ok(());
    };
    let operator = Operator::new(&settings, Some(store))?;
    println!("operator:");
    let commands = [
        ("user", Command::UserPlays(user)),
        ("guild", Command::GuildPlays(guild.clone())),
        (
            "shards",
            Command::Shards {
                known: vec![guild.clone()],
            },
        ),
    ];
    for (label, command) in commands {
        match operator.handle(&owner, &guild, command) {
            Ok(reply) => println!("  {label}: {reply}"),
            Err(err) => println!("  {label}: {err}"),
        }
    }
    Ok(())
}
