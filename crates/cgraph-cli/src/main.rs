use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cgraph_core::Prediction;
use cgraph_graph::{similar_profiles, GraphConfig};
use cgraph_storage::{MemoryStore, PgStore, Store};
use cgraph_sync::{
    build_graph, compare_users, notifier_from_env, predict_for_user, EnrichmentConfig,
    EnrichmentPipeline, ImportConfig, ImportPipeline,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cgraph-cli")]
#[command(about = "Contact graph command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a contact export (CSV file, archive or directory) for one user.
    Import {
        path: PathBuf,
        #[arg(long)]
        user: Uuid,
        #[arg(long, env = "CGRAPH_OWNER_NAME")]
        owner_name: Option<String>,
    },
    /// Enrich the user's not-yet-enriched profiles.
    Enrich {
        #[arg(long)]
        user: Uuid,
    },
    BuildGraph {
        #[arg(long)]
        user: Option<Uuid>,
    },
    Predict {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Compare {
        #[arg(long)]
        user_a: Uuid,
        #[arg(long)]
        user_b: Uuid,
    },
    /// Profiles whose embeddings are closest to the given profile.
    Similar {
        #[arg(long)]
        profile: Uuid,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },
    Migrate,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import {
            path,
            user,
            owner_name,
        } => {
            let mut config = ImportConfig::from_env();
            config.owner_name = owner_name;
            let pipeline = ImportPipeline::new(open_store().await?, config);
            let summary = pipeline.import_path(&path, user).await?;
            println!(
                "import complete: run_id={} contacts={} profiles={} connections={} rejected={} reports={}",
                summary.run_id,
                summary.contacts_resolved,
                summary.profiles_persisted,
                summary.connections_upserted,
                summary.validation_failures,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Enrich { user } => {
            let pipeline = EnrichmentPipeline::new(open_store().await?, &EnrichmentConfig::from_env())?;
            let summary = pipeline.run(user, &cancel_on_ctrl_c()).await?;
            println!(
                "enrichment complete: candidates={} ai={} rules={} failed={} cancelled={}",
                summary.candidates,
                summary.enriched_ai,
                summary.enriched_rules,
                summary.failed,
                summary.cancelled
            );
        }
        Commands::BuildGraph { user } => {
            let summary = build_graph(
                open_store().await?,
                GraphConfig::from_env(),
                user,
                &cancel_on_ctrl_c(),
            )
            .await?;
            println!(
                "graph build complete: passes={} edges_created={} failures={} cancelled={}",
                summary.passes.len(),
                summary.edges_created(),
                summary.failures(),
                summary.cancelled
            );
        }
        Commands::Predict { user, limit } => {
            let store = open_store().await?;
            let predictions = predict_for_user(store.as_ref(), user).await?;
            for prediction in predictions.iter().take(limit) {
                println!("{}", prediction_line(prediction));
            }
        }
        Commands::Compare { user_a, user_b } => {
            let store = open_store().await?;
            let notifier = notifier_from_env()?;
            let outcome = compare_users(store.as_ref(), notifier.as_ref(), user_a, user_b).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("serializing comparison")?
            );
        }
        Commands::Similar { profile, k } => {
            let store = open_store().await?;
            let node_key = store
                .node_for_profile(profile)
                .await?
                .with_context(|| format!("profile {profile} has no graph node; run build-graph first"))?;
            for similar in similar_profiles(store.as_ref(), &node_key, k).await? {
                println!("{:.3}\t{}\t{}", similar.similarity, similar.node_key, similar.label);
            }
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(&url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let state = cgraph_web::AppState::new(open_store().await?, notifier_from_env()?);
            cgraph_web::serve(state, port.unwrap_or_else(cgraph_web::port_from_env)).await?;
        }
    }

    Ok(())
}

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
async fn open_store() -> Result<Arc<dyn Store>> {
    match std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()) {
        Some(url) => {
            let store = PgStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, nothing will persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn prediction_line(prediction: &Prediction) -> String {
    format!(
        "{:.2}\t{}\t{}",
        prediction.score, prediction.profile_id, prediction.reason
    )
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next batch boundary");
            child.cancel();
        }
    });
    token
}
