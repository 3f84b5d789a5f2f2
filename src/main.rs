//! p2p-share-node - Main entry point
//!
//! Shares files, serves them to peers and downloads them.

use anyhow::{Context, Result};
use p2p_share_node::cli::progress::format_bytes;
use p2p_share_node::{
    CliArgs, Command, Config, DownloadOutcome, FileManifest, Node, NodeError, ProgressDisplay, ResumeStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    match &args.command {
        Command::Share { file, .. } => run_share(&config, file).await,
        Command::Serve { files, .. } => run_serve(&config, files).await,
        Command::Get { manifest, output, .. } => run_get(&config, manifest, output.as_deref()).await,
        Command::Stat => run_stat(&config).await,
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized");
}

fn manifest_path(shared_dir: &Path, file_hash: &str) -> PathBuf {
    shared_dir.join(format!("{}.json", file_hash))
}

async fn load_manifest(path: &Path) -> Result<FileManifest> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        error!("Failed to read manifest '{}': {}", path.display(), e);
        NodeError::storage_error_full("Failed to read manifest", path.display().to_string(), e.to_string())
    })?;
    let manifest: FileManifest = serde_json::from_slice(&bytes).map_err(|e| {
        NodeError::validation_error_with_field(format!("Malformed manifest '{}': {}", path.display(), e), "manifest")
    })?;
    manifest.validate()?;
    Ok(manifest)
}

/// Hash a file and write its manifest into the shared directory
async fn run_share(config: &Config, file: &Path) -> Result<()> {
    let manifest = FileManifest::from_path(file, config.piece_size)
        .await
        .with_context(|| format!("Failed to hash {}", file.display()))?;

    tokio::fs::create_dir_all(&config.shared_dir).await?;
    let path = manifest_path(&config.shared_dir, &manifest.file_hash);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await.map_err(|e| {
        NodeError::storage_error_full("Failed to write manifest", path.display().to_string(), e.to_string())
    })?;

    info!("Wrote manifest {}", path.display());
    println!("{}", manifest.file_hash);
    if !config.is_quiet() {
        println!("  Name: {}", manifest.file_name);
        println!("  Size: {} ({} pieces of {})", format_bytes(manifest.file_size), manifest.piece_count, format_bytes(manifest.piece_size as u64));
        println!("  Manifest: {}", path.display());
    }
    Ok(())
}

/// Run a node until Ctrl-C, offering every shared file to the peers
async fn run_serve(config: &Config, files: &[PathBuf]) -> Result<()> {
    let mut node = Node::start(config.node_config()).await?;
    for peer in config.parse_peers()? {
        node.directory().add_peer(peer);
    }

    for file in files {
        let manifest = node
            .controller()
            .share_file(file, config.piece_size)
            .await
            .with_context(|| format!("Failed to share {}", file.display()))?;
        tokio::fs::create_dir_all(&config.shared_dir).await?;
        let path = manifest_path(&config.shared_dir, &manifest.file_hash);
        if let Err(e) = tokio::fs::write(&path, serde_json::to_vec_pretty(manifest.as_ref())?).await {
            warn!("Failed to write manifest {}: {}", path.display(), e);
        }
        let accepted = node.controller().offer_to_peers(&manifest.file_hash).await?;
        println!("Sharing {} as {} ({} peers accepted)", file.display(), manifest.file_hash, accepted);
    }

    println!(
        "Node {} serving on control {} / data {} (Ctrl-C to stop)",
        node.peer_id(),
        node.control_addr(),
        node.data_addr()
    );
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    node.stop();
    Ok(())
}

/// Download the file described by a manifest
async fn run_get(config: &Config, manifest_file: &Path, output: Option<&Path>) -> Result<()> {
    let manifest = load_manifest(manifest_file).await?;
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => {
            tokio::fs::create_dir_all(&config.download_dir).await?;
            config.download_dir.join(&manifest.file_name)
        }
    };

    let mut node = Node::start(config.node_config()).await?;
    let controller = Arc::clone(node.controller());
    controller.manifests().add_manifest(manifest.clone());
    for peer in config.parse_peers()? {
        controller.manifests().register_peer_for_file(&manifest.file_hash, &peer.id);
        node.directory().add_peer(peer);
    }

    let progress = Arc::new(ProgressDisplay::new(&manifest, config.is_quiet()));
    controller.events().add_listener(progress.clone());
    progress.print_status(&format!(
        "Downloading {} ({}) to {}",
        manifest.file_name,
        format_bytes(manifest.file_size),
        output.display()
    ))?;

    let handle = controller.start_download(&manifest.file_hash, &output).await?;
    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling download");
            controller.cancel_transfer(&manifest.file_hash);
            DownloadOutcome::Cancelled
        }
    };

    let stats = controller.stats();
    debug!("Transfer stats: {:?}", stats.transfer);
    node.stop();

    match outcome {
        DownloadOutcome::Completed => Ok(()),
        DownloadOutcome::Cancelled => {
            progress.print_status("Download cancelled; rerun to resume")?;
            Ok(())
        }
        DownloadOutcome::Failed(reason) => Err(anyhow::anyhow!("Download failed: {}", reason)),
    }
}

/// List manifests and resumable downloads
async fn run_stat(config: &Config) -> Result<()> {
    let mut manifests = Vec::new();
    match tokio::fs::read_dir(&config.shared_dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match load_manifest(&path).await {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }
        Err(e) => debug!("No shared directory {}: {}", config.shared_dir.display(), e),
    }
    manifests.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    println!("Manifests ({}):", manifests.len());
    for manifest in &manifests {
        println!(
            "  {}  {}  {}  {} pieces",
            manifest.file_hash,
            manifest.file_name,
            format_bytes(manifest.file_size),
            manifest.piece_count
        );
    }

    let resume = ResumeStore::new(config.resume_dir.clone());
    let resumable = resume.list_resumable().await;
    println!("Resumable downloads ({}):", resumable.len());
    for file_hash in resumable {
        match resume.load(&file_hash).await {
            Some(checkpoint) => println!(
                "  {}  {}/{} pieces  {}",
                file_hash,
                checkpoint.downloaded_pieces.count(),
                checkpoint.downloaded_pieces.len(),
                checkpoint
                    .output_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
            None => println!("  {}  (unreadable)", file_hash),
        }
    }
    Ok(())
}
