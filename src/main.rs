//! pathfuse daemon entry point
//!
//! Mounts an in-memory filesystem described by a YAML config file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use pathfuse::config::Config;
use pathfuse::filesystem::memory::MemoryFs;
use pathfuse::{FuseFileSystemAdapter, ShutdownHooks};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: pathfuse <config.yaml>");
    eprintln!();
    eprintln!("pathfuse - mount an in-memory filesystem through FUSE");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  pathfuse /etc/pathfuse/config.yaml");
}

// Not #[tokio::main]: the dispatcher owns its runtime, which must not be
// dropped from async context.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("pathfuse starting");
    info!("Loaded configuration from {:?}", config_path);

    let mount = &config.mount;

    // Create mount point directory if it doesn't exist
    if !mount.path.exists() {
        debug!("Creating mount point directory {:?}", mount.path);
        if let Err(e) = std::fs::create_dir_all(&mount.path) {
            error!("Failed to create mount point {:?}: {}", mount.path, e);
            std::process::exit(1);
        }
    }

    let hooks = ShutdownHooks::new();
    let mut builder =
        FuseFileSystemAdapter::builder(Arc::new(MemoryFs::new(mount.name.clone())), &mount.path)
            .mount_timeout(mount.timeout)
            .shutdown_hooks(hooks.clone());
    if let Some(threads) = mount.worker_threads {
        builder = builder.worker_threads(threads);
    }
    let adapter = builder.build()?;

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let h = hooks.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
        h.run();
    })?;

    let options = mount.to_options();
    if let Err(e) = adapter.mount(&options) {
        error!("Failed to mount {:?}: {}", mount.path, e);
        std::process::exit(1);
    }

    if !options.blocking {
        info!("Mounted {:?}", adapter.mount_point());
        info!("Press Ctrl+C to unmount and exit");

        // Wait for shutdown signal
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    info!("Shutting down");
    hooks.run();
    adapter.umount(false)?;
    info!("Filesystem unmounted, exiting");

    Ok(())
}
