use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tierload_core::{LoadError, RegionState, RenderError, Tier};
use tierload_runtime::{
    ContentOptions, LoadOutput, LoaderConfig, LoaderRegistry, MetricsSnapshot, PrefetchConfig,
    ProgressiveLoader, PrometheusExporter, RegionContext, RenderDispatcher, SkeletonId, ViewChange,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const REGION_HEIGHT: f64 = 300.0;
const REGION_SPACING: f64 = 400.0;
const CONTENT_TYPES: [&str; 4] = ["meals", "recipe", "nutrition", "shopping-list"];

#[derive(Parser)]
#[command(name = "tierload")]
#[command(version)]
#[command(about = "tierload - priority-tiered progressive content loading", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default tier table
    Tiers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Simulate a scrolling page of regions backed by fake loaders
    Simulate {
        /// Number of regions on the page
        #[arg(short, long, default_value_t = 16)]
        regions: usize,

        /// Simulated loader latency
        #[arg(long, default_value_t = 40)]
        latency_ms: u64,

        /// Fail every Nth loader invocation (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,

        /// Per-invocation load timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Pixels scrolled per step
        #[arg(long, default_value_t = 800.0)]
        scroll_step: f64,

        /// Pause between scroll steps
        #[arg(long, default_value_t = 100)]
        scroll_interval_ms: u64,

        /// Prefetch worker interval
        #[arg(long, default_value_t = 300)]
        prefetch_interval_ms: u64,

        /// Disable the prefetch lane
        #[arg(long)]
        no_prefetch: bool,

        /// Add a region whose content type has no loader
        #[arg(long)]
        unsupported: bool,

        /// How long to wait for regions to settle after scrolling
        #[arg(long, default_value_t = 5000)]
        settle_ms: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Prometheus,
}

#[derive(Serialize)]
struct TierRow {
    tier: Tier,
    batch_size: usize,
    inter_batch_delay_ms: u64,
    proximity_threshold: f64,
}

#[derive(Serialize)]
struct RegionSummary {
    region_id: String,
    content_type: String,
    tier: Tier,
    state: RegionState,
}

#[derive(Serialize)]
struct SimulationReport {
    regions: Vec<RegionSummary>,
    history: Vec<ViewChange>,
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct MealPlan {
    day: u64,
    meals: Vec<String>,
}

#[derive(Serialize)]
struct Recipe {
    title: String,
    minutes: u64,
    steps: Vec<String>,
}

#[derive(Serialize)]
struct Nutrition {
    calories: u64,
    protein_g: u64,
    carbs_g: u64,
}

#[derive(Serialize)]
struct ShoppingList {
    items: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so JSON and Prometheus output stay parseable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tierload=info,tierload_runtime=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tiers { json } => {
            let config = LoaderConfig::from_env();
            let rows: Vec<TierRow> = config
                .tiers
                .iter()
                .map(|(tier, cfg)| TierRow {
                    tier,
                    batch_size: cfg.batch_size,
                    inter_batch_delay_ms: cfg.inter_batch_delay.as_millis() as u64,
                    proximity_threshold: cfg.proximity_threshold,
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows).context("failed to encode tier table")?);
            } else {
                println!("{:<12} {:>6} {:>10} {:>10}", "TIER", "BATCH", "DELAY", "THRESHOLD");
                for row in &rows {
                    println!(
                        "{:<12} {:>6} {:>8}ms {:>8}px",
                        row.tier.as_str(), row.batch_size, row.inter_batch_delay_ms, row.proximity_threshold
                    );
                }
            }
        }

        Commands::Simulate {
            regions,
            latency_ms,
            fail_every,
            timeout_ms,
            scroll_step,
            scroll_interval_ms,
            prefetch_interval_ms,
            no_prefetch,
            unsupported,
            settle_ms,
            format,
        } => {
            let mut config = LoaderConfig::from_env();
            config.prefetch = if no_prefetch {
                PrefetchConfig::disabled()
            } else {
                PrefetchConfig {
                    interval: Duration::from_millis(prefetch_interval_ms.max(1)),
                    ..config.prefetch
                }
            };
            if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
                config = config.with_load_timeout(Duration::from_millis(ms));
            }

            let invocations = Arc::new(AtomicU64::new(0));
            let registry = simulated_registry(Duration::from_millis(latency_ms), fail_every, &invocations);
            let renderer = Arc::new(page_renderer());
            let loader = ProgressiveLoader::new(config, registry, renderer.clone());

            info!(regions, latency_ms, fail_every, "Starting simulation");

            let mut layout = page_layout(regions);
            if unsupported {
                layout.push(("video-0".to_string(), "video", Tier::Normal));
            }

            for (index, (region_id, content_type, tier)) in layout.iter().enumerate() {
                loader.trigger().place(region_id, index as f64 * REGION_SPACING, REGION_HEIGHT);
                let options = ContentOptions::new(*tier)
                    .with_params(serde_json::json!({ "index": index }));
                let options = if matches!(tier, Tier::Low | Tier::Background) {
                    options.with_prefetch()
                } else {
                    options
                };
                loader.register_content(region_id.as_str(), *content_type, options);
            }

            // Scroll to the bottom of the page
            let page_height = layout.len() as f64 * REGION_SPACING;
            let mut scroll_top = 0.0;
            while scroll_top < page_height {
                tokio::time::sleep(Duration::from_millis(scroll_interval_ms)).await;
                scroll_top += scroll_step.max(1.0);
                loader.trigger().scroll_to(scroll_top);
            }

            let deadline = tokio::time::Instant::now() + Duration::from_millis(settle_ms);
            while tokio::time::Instant::now() < deadline && !all_settled(&loader, &layout) {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }

            let summaries: Vec<RegionSummary> = layout
                .iter()
                .map(|(region_id, content_type, tier)| RegionSummary {
                    region_id: region_id.clone(),
                    content_type: content_type.to_string(),
                    tier: *tier,
                    state: loader.region_state(region_id).unwrap_or(RegionState::Skeleton),
                })
                .collect();
            let metrics = loader.get_metrics();

            info!(
                invocations = invocations.load(Ordering::Relaxed),
                rendered = renderer.rendered_count(),
                "Simulation finished"
            );

            match format {
                OutputFormat::Text => print_text(&summaries, &renderer.history(), &metrics),
                OutputFormat::Json => {
                    let report = SimulationReport { regions: summaries, history: renderer.history(), metrics };
                    println!("{}", serde_json::to_string_pretty(&report).context("failed to encode report")?);
                }
                OutputFormat::Prometheus => {
                    let exporter = PrometheusExporter::new().context("failed to create metrics exporter")?;
                    print!("{}", exporter.render(&metrics));
                }
            }
        }
    }

    Ok(())
}

/// Region ids, content types and tiers from the top of the page down
fn page_layout(regions: usize) -> Vec<(String, &'static str, Tier)> {
    (0..regions)
        .map(|index| {
            let content_type = CONTENT_TYPES[index % CONTENT_TYPES.len()];
            let tier = match index {
                0..=1 => Tier::Critical,
                2..=4 => Tier::High,
                5..=8 => Tier::Normal,
                9..=12 => Tier::Low,
                _ => Tier::Background,
            };
            (format!("{}-{}", content_type, index), content_type, tier)
        })
        .collect()
}

fn all_settled(loader: &ProgressiveLoader, layout: &[(String, &'static str, Tier)]) -> bool {
    layout
        .iter()
        .all(|(region_id, _, _)| loader.region_state(region_id).is_some_and(|s| s.is_terminal()))
}

/// Loaders for every simulated content type sharing one invocation counter
fn simulated_registry(latency: Duration, fail_every: u64, invocations: &Arc<AtomicU64>) -> LoaderRegistry {
    let mut registry = LoaderRegistry::new();

    for content_type in CONTENT_TYPES {
        let invocations = Arc::clone(invocations);
        let loader = move |ctx: RegionContext, _tier: Tier| {
            let invocations = Arc::clone(&invocations);
            async move {
                let call = invocations.fetch_add(1, Ordering::Relaxed) + 1;
                tokio::time::sleep(latency).await;
                if fail_every > 0 && call % fail_every == 0 {
                    return Err(LoadError::failed(format!("simulated outage on call {}", call)));
                }
                simulated_payload(&ctx)
            }
        };
        registry.register(content_type, SkeletonId::new(format!("{}-skeleton", content_type)), loader);
    }

    registry
}

fn simulated_payload(ctx: &RegionContext) -> Result<LoadOutput, LoadError> {
    let index = ctx.params.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
    let ttl = Duration::from_secs(300);

    match ctx.content_type.as_str() {
        "meals" => LoadOutput::from_serializable(
            &MealPlan {
                day: index % 7 + 1,
                meals: vec!["oatmeal".into(), "lentil soup".into(), "grilled salmon".into()],
            },
            ttl,
        ),
        "recipe" => LoadOutput::from_serializable(
            &Recipe {
                title: format!("Recipe #{}", index),
                minutes: 20 + index * 5,
                steps: vec!["prep".into(), "cook".into(), "serve".into()],
            },
            ttl,
        ),
        "nutrition" => LoadOutput::from_serializable(
            &Nutrition { calories: 1800 + index * 10, protein_g: 90, carbs_g: 210 },
            ttl,
        ),
        "shopping-list" => LoadOutput::from_serializable(
            &ShoppingList { items: vec!["spinach".into(), "chickpeas".into(), "lemons".into()] },
            ttl,
        ),
        other => Err(LoadError::failed(format!("no simulated data for '{}'", other))),
    }
}

fn page_renderer() -> RenderDispatcher {
    RenderDispatcher::new()
        .with_renderer("meals", |payload| {
            let meals = string_list(payload, "meals")?;
            Ok(format!("<ul class=\"meals\">{}</ul>", list_items(&meals)))
        })
        .with_renderer("recipe", |payload| {
            let title = payload
                .get("title")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RenderError::failed("recipe without title"))?;
            Ok(format!("<article><h3>{}</h3></article>", title))
        })
        .with_renderer("nutrition", |payload| {
            let calories = payload
                .get("calories")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| RenderError::failed("nutrition without calories"))?;
            Ok(format!("<div class=\"nutrition\">{} kcal</div>", calories))
        })
        .with_renderer("shopping-list", |payload| {
            let items = string_list(payload, "items")?;
            Ok(format!("<ul class=\"shopping\">{}</ul>", list_items(&items)))
        })
}

fn string_list(payload: &serde_json::Value, field: &str) -> Result<Vec<String>, RenderError> {
    payload
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .ok_or_else(|| RenderError::failed(format!("missing '{}' list", field)))
}

fn list_items(items: &[String]) -> String {
    items.iter().map(|item| format!("<li>{}</li>", item)).collect()
}

fn print_text(regions: &[RegionSummary], history: &[ViewChange], metrics: &MetricsSnapshot) {
    println!("=== View Transitions ===");
    for change in history {
        let view = serde_json::to_value(&change.view).unwrap_or_default();
        let kind = view.get("view").and_then(|v| v.as_str()).unwrap_or("unknown");
        println!("{:<20} {}", change.region_id, kind);
    }
    println!();

    println!("=== Regions ===");
    for region in regions {
        println!(
            "{:<20} {:<14} {:<11} {}",
            region.region_id,
            region.content_type,
            region.tier.as_str(),
            region.state
        );
    }
    println!();

    println!("=== Metrics ===");
    println!("Loader invocations: {}", metrics.total_requests);
    println!("Successful loads: {}", metrics.successful_loads);
    println!("Failed regions: {} ({} unsupported)", metrics.failed_loads, metrics.unsupported);
    println!(
        "Cache: {} hits / {} misses ({:.1}% hit rate), {} dedup joins",
        metrics.cache_hits,
        metrics.cache_misses,
        metrics.hit_rate() * 100.0,
        metrics.dedup_joins
    );
    println!("Retries scheduled: {}", metrics.retries_scheduled);
    println!("Average latency: {:.1}ms", metrics.avg_latency_ms);
    println!(
        "Prefetch: {} queued, {} executed, {} skipped",
        metrics.prefetch.queued, metrics.prefetch.executed, metrics.prefetch.skipped
    );
}
