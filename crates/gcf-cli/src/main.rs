use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcf_adapters::{MarketConfig, PortalsClient, TonnelClient};
use gcf_catalog::{source_from_config, CatalogBuilder, CatalogConfig, CatalogSnapshot};
use gcf_http::{HttpClientConfig, HttpFetcher};
use gcf_search::{SearchLimits, SearchParams, SearchPipeline};
use gcf_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gcf-cli")]
#[command(about = "Find marketplace gifts by the color of their model")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the catalog, then serve the HTTP API.
    Serve,
    /// Build the catalog and print a per-color summary.
    Catalog,
    /// Run one search and print the gifts as JSON.
    Search {
        #[arg(long)]
        color: String,
        /// Comma-separated collection names.
        #[arg(long)]
        collections: Option<String>,
        /// Comma-separated backdrop names.
        #[arg(long)]
        backdrops: Option<String>,
        #[arg(long)]
        min_price: Option<String>,
        #[arg(long)]
        max_price: Option<String>,
        /// `price_asc` or `price_desc`.
        #[arg(long)]
        sort: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("GCF_LOG_FORMAT").as_deref() {
        Ok("json") => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn build_catalog(http: Arc<HttpFetcher>) -> CatalogSnapshot {
    let source = source_from_config(http, CatalogConfig::from_env());
    CatalogBuilder::new(source).build().await
}

fn build_pipeline(http: Arc<HttpFetcher>, catalog: &CatalogSnapshot) -> SearchPipeline {
    let market = MarketConfig::from_env();
    if market.portals_auth_data.is_none() {
        warn!("PORTALS_AUTH_DATA is not set; portals searches will return nothing");
    }
    if market.tonnel_auth_data.is_none() {
        warn!("TONNEL_AUTH_DATA is not set; tonnel searches will return nothing");
    }
    SearchPipeline::new(
        catalog.index.clone(),
        Arc::new(PortalsClient::new(http.clone(), &market)),
        Arc::new(TonnelClient::new(http, &market)),
    )
    .with_limits(SearchLimits::from_env())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig::from_env()).context("building http client")?,
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let catalog = build_catalog(http.clone()).await;
            let pipeline = build_pipeline(http, &catalog);
            let config = WebConfig::from_env();
            info!(port = config.port, "starting web server");
            gcf_web::serve(AppState::new(catalog, pipeline), &config).await?;
        }
        Commands::Catalog => {
            let catalog = build_catalog(http).await;
            println!(
                "catalog built_at={} collections={} backdrops={} indexed_pairs={}",
                catalog.built_at.to_rfc3339(),
                catalog.collections.len(),
                catalog.backdrops.len(),
                catalog.index.len()
            );
            for (color, count) in catalog.index.color_counts() {
                println!("{color:>8} {count}");
            }
        }
        Commands::Search {
            color,
            collections,
            backdrops,
            min_price,
            max_price,
            sort,
        } => {
            let params = SearchParams {
                color: Some(color),
                collections,
                backdrops,
                min_price,
                max_price,
                sort,
            };
            let Some(query) = params.into_query()? else {
                println!("[]");
                return Ok(());
            };
            let catalog = build_catalog(http.clone()).await;
            let pipeline = build_pipeline(http, &catalog);
            let report = pipeline.search_with_report(&query).await;
            for failure in &report.failures {
                eprintln!(
                    "source failed: {} collection={} error={}",
                    failure.source,
                    failure.collection.as_deref().unwrap_or("*"),
                    failure.message
                );
            }
            let json = serde_json::to_string_pretty(&report.gifts).context("encoding gifts")?;
            println!("{json}");
        }
    }

    Ok(())
}
