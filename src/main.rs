//! Pyramid Cache - persistent tile pyramids for very large images.
//!
//! This binary runs the HTTP server and the cache maintenance commands.

use std::ops::ControlFlow;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyramid_cache::{
    config::{CacheArgs, ClearCommand, Cli, Command, ImageCommand, ServeConfig},
    server::{create_shared_router, RouterConfig},
    CacheConfig, CacheManager, ImageIdentity, Progress,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Open(command) => run_open(command).await,
        Command::Warm(command) => run_warm(command).await,
        Command::Stats(args) => run_stats(args).await,
        Command::Clear(command) => run_clear(command).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pyramid_cache=debug,tower_http=debug"
    } else {
        "pyramid_cache=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolve and validate cache settings, logging the reason on failure.
fn cache_config(args: &CacheArgs) -> Option<CacheConfig> {
    match args.to_cache_config() {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            None
        }
    }
}

/// Build a manager from a validated configuration, logging any failure.
fn open_manager(cache: CacheConfig) -> Option<CacheManager> {
    match CacheManager::with_default_codec(cache) {
        Ok(manager) => Some(manager),
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

/// Print a value as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(cache) = cache_config(&config.cache) else {
        return ExitCode::FAILURE;
    };

    info!("Pyramid Cache v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Cache root: {}", cache.root_dir.display());
    info!(
        "  Tiles: {}px at quality {}, overviews {}px/{}px at quality {}",
        cache.tile_size,
        cache.tile_quality,
        cache.thumbnail_size,
        cache.medium_size,
        cache.overview_quality
    );
    info!(
        "  Decoding: {} concurrent, {}MB decoded pixel cache, {}MB alloc limit",
        cache.decode_concurrency,
        cache.decode_cache_bytes / (1024 * 1024),
        cache.decode_max_alloc / (1024 * 1024)
    );
    info!("  Memory tile cache: {}MB", cache.memory_cache_bytes / (1024 * 1024));

    let Some(manager) = open_manager(cache).map(Arc::new) else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = manager.store().ensure_root().await {
        error!("Cannot create cache root: {}", e);
        return ExitCode::FAILURE;
    }

    let router = create_shared_router(manager, build_router_config(&config));
    let addr = config.bind_address();

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}/health", addr);
    info!(
        "  curl -X POST -H 'content-type: application/json' -d '{{\"path\":\"/abs/image.tif\"}}' http://{}/images",
        addr
    );

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = RouterConfig::new().with_cache_max_age(config.cache_max_age);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

// =============================================================================
// Open / Warm Commands
// =============================================================================

async fn run_open(command: ImageCommand) -> ExitCode {
    let Some(cache) = cache_config(&command.cache) else {
        return ExitCode::FAILURE;
    };
    let Some(manager) = open_manager(cache) else {
        return ExitCode::FAILURE;
    };

    match manager.load_image(&command.path).await {
        Ok(image) => print_json(&image),
        Err(e) => {
            error!("Failed to open {}: {}", command.path.display(), e);
            ExitCode::FAILURE
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WarmSummary {
    identity: ImageIdentity,
    total_tiles: u64,
    tiles_generated: u64,
    completed: bool,
}

async fn run_warm(command: ImageCommand) -> ExitCode {
    let Some(cache) = cache_config(&command.cache) else {
        return ExitCode::FAILURE;
    };
    let Some(manager) = open_manager(cache) else {
        return ExitCode::FAILURE;
    };

    let report = |progress: Progress| {
        // Roughly every 5%, and always at the end
        let step = (progress.total / 20).max(1);
        if progress.done % step == 0 || progress.done == progress.total {
            info!("Warmed {}/{} tiles", progress.done, progress.total);
        }
        ControlFlow::Continue(())
    };

    match manager.warm(&command.path, report).await {
        Ok(build) => print_json(&WarmSummary {
            identity: build.identity,
            total_tiles: build.metadata.total_tiles,
            tiles_generated: build.tiles_generated,
            completed: build.completed,
        }),
        Err(e) => {
            error!("Failed to warm {}: {}", command.path.display(), e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Maintenance Commands
// =============================================================================

async fn run_stats(args: CacheArgs) -> ExitCode {
    let Some(cache) = cache_config(&args) else {
        return ExitCode::FAILURE;
    };
    let Some(manager) = open_manager(cache) else {
        return ExitCode::FAILURE;
    };

    match manager.get_stats().await {
        Ok(stats) => print_json(&stats),
        Err(e) => {
            error!("Failed to read cache statistics: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_clear(command: ClearCommand) -> ExitCode {
    let Some(cache) = cache_config(&command.cache) else {
        return ExitCode::FAILURE;
    };
    let Some(manager) = open_manager(cache) else {
        return ExitCode::FAILURE;
    };

    let result = match command.identity {
        Some(raw) => {
            let identity = match ImageIdentity::parse(&raw) {
                Ok(identity) => identity,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            manager.invalidate(&identity).await.map(|removed| {
                if !removed {
                    info!("Nothing cached for {}", identity);
                }
            })
        }
        None => manager.invalidate_all().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to clear cache: {}", e);
            ExitCode::FAILURE
        }
    }
}
