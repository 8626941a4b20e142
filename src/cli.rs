//! Command surface (§6a): argument parsing plus the dispatch glue that
//! wires configuration, the application context, and the net/transfer
//! layers together. Each subcommand mirrors the exact behavior spelled
//! out for it — file placement, default values, and exit semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::config::{self, KeyMeshConfig};
use crate::constants;
use crate::context::AppContext;
use crate::error::KeyMeshError;
use crate::hash::HashPolicy;
use crate::manifest::{differ, indexer, store};
use crate::net::{client as net_client, server as net_server, tls};
use crate::transfer::engine::{EngineConfig, PeerTarget, TransferEngine};
use crate::transfer::TaskStatus;

#[derive(Parser, Debug)]
#[command(name = "keymesh", version, about = "KeyMesh peer-to-peer file sync daemon")]
pub struct Cli {
    #[arg(long, global = true, default_value = constants::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scaffold a default config and share directories.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Validate config and certificate material existence.
    Check,
    /// Print one `name: path` line per configured share.
    ListShares,
    /// Build and persist manifests.
    Manifest {
        #[arg(long)]
        share: Option<String>,
        #[arg(long, default_value = "out/manifests")]
        out: PathBuf,
    },
    /// Compare local vs. the peer's last-known manifest.
    Diff {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        share: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the node: server accept loop, client connectors, transfer engine.
    Run {
        #[arg(long)]
        bind_host: Option<String>,
        #[arg(long)]
        status_port: Option<u16>,
        #[arg(long)]
        once_handshake: bool,
    },
    /// Enqueue one push and block until it reaches a terminal status.
    Send {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        share: String,
        #[arg(long)]
        file: String,
    },
    /// Print the persisted queue snapshot.
    Queue,
    /// Drop a cancel flag for a running or queued task.
    Cancel { task_id: u64 },
    /// Query the local status endpoint and print JSON.
    Peers,
}

fn post_init_note() -> String {
    std::fs::read_to_string("scripts/post-init-note.txt").unwrap_or_else(|_| {
        "KeyMesh initialized. Edit config.yaml with your node id, certificate paths, \
         peers, and shares, then run `keymesh check` before `keymesh run`."
            .to_string()
    })
}

/// Create each share's directory, and seed a default ignore file for any
/// share that configures one and does not already have one on disk.
fn scaffold_shares(cfg: &KeyMeshConfig) -> std::io::Result<()> {
    for share in &cfg.shares {
        std::fs::create_dir_all(&share.path)?;
        if let Some(ignore_file) = &share.ignore_file {
            let path = Path::new(&share.path).join(ignore_file);
            if !path.exists() {
                std::fs::write(&path, "# KeyMesh ignore patterns\n")?;
            }
        }
    }
    Ok(())
}

async fn cmd_init(config_path: &Path, force: bool) -> Result<(), KeyMeshError> {
    if config_path.exists() && !force {
        tracing::warn!(
            path = %config_path.display(),
            "config already exists, leaving it untouched (pass --force to overwrite)"
        );
    } else {
        std::fs::copy(constants::DEFAULT_CONFIG_SAMPLE, config_path)?;
    }

    let sample = config::load(Path::new(constants::DEFAULT_CONFIG_SAMPLE), false)?;
    scaffold_shares(&sample)?;

    println!("{}", post_init_note());
    Ok(())
}

async fn cmd_check(config_path: &Path) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, true)?;
    scaffold_shares(&cfg)?;

    println!("bind address: {}:{}", cfg.node.bind_host, cfg.node.listen_port);
    let peer_ids: Vec<&str> = cfg.peers.iter().map(|p| p.id.as_str()).collect();
    println!("configured peers: {}", peer_ids.join(", "));
    println!("Configuration check passed.");
    Ok(())
}

async fn cmd_list_shares(config_path: &Path) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    for share in &cfg.shares {
        println!("{}: {}", share.name, share.path.display());
    }
    Ok(())
}

fn indexer_config(cfg: &KeyMeshConfig) -> indexer::IndexerConfig {
    indexer::IndexerConfig {
        hash_policy: cfg
            .indexing
            .hash_policy
            .parse::<HashPolicy>()
            .unwrap_or(HashPolicy::Auto),
        small_threshold_mb: cfg.indexing.small_threshold_mb,
        sample_mb: cfg.indexing.sample_mb,
        ignore_hidden: cfg.indexing.ignore_hidden,
        max_workers: cfg.indexing.max_workers,
    }
}

async fn build_manifest_for_share(
    cfg: &KeyMeshConfig,
    share_name: &str,
) -> Result<crate::manifest::Manifest, KeyMeshError> {
    let share = cfg
        .share(share_name)
        .ok_or_else(|| KeyMeshError::Other(anyhow::anyhow!("unknown share {share_name}")))?;
    let ignore_path = share
        .ignore_file
        .as_ref()
        .map(|f| Path::new(&share.path).join(f))
        .unwrap_or_else(|| Path::new(&share.path).join(constants::DEFAULT_SHARE_IGNORE));
    let patterns = crate::util::ignore::load_ignore_patterns(&ignore_path)?;
    let manifest = indexer::build_manifest(
        &share.name,
        share.path.clone(),
        patterns,
        indexer_config(cfg),
    )
    .await?;
    Ok(manifest)
}

async fn cmd_manifest(
    config_path: &Path,
    share: Option<String>,
    out: PathBuf,
) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    let names: Vec<String> = match share {
        Some(s) => vec![s],
        None => cfg.shares.iter().map(|s| s.name.clone()).collect(),
    };
    for name in names {
        let manifest = build_manifest_for_share(&cfg, &name).await?;
        store::save_manifest(&out, &manifest)?;
        println!(
            "{}: {} entries, {} ignored, {} skipped",
            manifest.share,
            manifest.entries.len(),
            manifest.policy.ignore_count,
            manifest.policy.skipped
        );
    }
    Ok(())
}

async fn diff_one_share(
    cfg: &KeyMeshConfig,
    share_name: &str,
    manifest_dir: &Path,
) -> Result<differ::DiffResult, KeyMeshError> {
    let local = build_manifest_for_share(cfg, share_name).await?;
    let remote = store::load_latest_manifest(manifest_dir, share_name)?.unwrap_or(
        crate::manifest::Manifest {
            share: share_name.to_string(),
            generated_at: String::new(),
            entries: Vec::new(),
            policy: crate::manifest::ManifestPolicy {
                hash: "auto".to_string(),
                ignore_count: 0,
                skipped: 0,
                small_threshold_mb: cfg.indexing.small_threshold_mb,
                sample_mb: cfg.indexing.sample_mb,
            },
        },
    );
    Ok(differ::compare_manifests(&local, &remote))
}

async fn cmd_diff(
    config_path: &Path,
    peer: String,
    share: Option<String>,
    output: Option<PathBuf>,
    dry_run: bool,
) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    if dry_run {
        tracing::debug!("dry-run requested; diff never enqueues transfers regardless");
    }
    let manifest_dir = PathBuf::from("out/manifests").join(&peer);
    let allowed = cfg.allowed_shares_for_peer(&peer);

    let body = match share {
        Some(name) => {
            let diff = diff_one_share(&cfg, &name, &manifest_dir).await?;
            serde_json::to_value(diff).expect("diff result always serializable")
        }
        None => {
            let mut by_share = serde_json::Map::new();
            for name in &allowed {
                let diff = diff_one_share(&cfg, name, &manifest_dir).await?;
                by_share.insert(
                    name.clone(),
                    serde_json::to_value(diff).expect("diff result always serializable"),
                );
            }
            serde_json::Value::Object(by_share)
        }
    };

    let rendered = serde_json::to_string_pretty(&body).expect("json value always renderable");
    match output {
        Some(path) => std::fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn build_tls_configs(
    cfg: &KeyMeshConfig,
) -> Result<(Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>), KeyMeshError> {
    let server = tls::build_server_config(&cfg.security.ca_cert, &cfg.security.cert, &cfg.security.key)?;
    let client = tls::build_client_config(&cfg.security.ca_cert, &cfg.security.cert, &cfg.security.key)?;
    Ok((server, client))
}

fn build_engine(
    cfg: &KeyMeshConfig,
    tls_client_config: Arc<rustls::ClientConfig>,
) -> Arc<TransferEngine> {
    let share_roots: HashMap<String, PathBuf> = cfg
        .shares
        .iter()
        .map(|s| (s.name.clone(), s.path.clone()))
        .collect();
    let peers: HashMap<String, PeerTarget> = cfg
        .peers
        .iter()
        .map(|p| {
            (
                p.id.clone(),
                PeerTarget {
                    address: p.addr.clone(),
                    expected_fingerprint: p.cert_fingerprint.clone(),
                },
            )
        })
        .collect();
    let engine_cfg = EngineConfig {
        node_id: cfg.node.id.clone(),
        chunk_size: cfg.transfer.chunk_size_mb * 1024 * 1024,
        max_concurrent_per_peer: cfg.transfer.max_concurrent_per_peer,
        retry_backoff: cfg.transfer.retry_backoff_sec.clone(),
        max_retries: cfg.transfer.max_retries,
        rate_limit_bytes_per_sec: cfg.transfer.rate_limit_mb_s.map(|mb| mb * 1024.0 * 1024.0),
        sessions_dir: cfg.transfer.sessions_dir.clone(),
        connect_timeout_ms: cfg.connectivity.connect_timeout_ms,
        whitelist: cfg.security.fingerprint_whitelist.clone(),
    };
    let audit = Arc::new(crate::audit::AuditLog::new(cfg.transfer.audit_log_dir.clone()));
    TransferEngine::new(engine_cfg, share_roots, peers, tls_client_config, audit)
}

async fn cmd_run(
    config_path: &Path,
    bind_host: Option<String>,
    status_port: Option<u16>,
    once_handshake: bool,
) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, true)?;
    let (server_tls, client_tls) = build_tls_configs(&cfg)?;
    let ctx = Arc::new(AppContext::new(Arc::new(cfg.clone())));

    let (stop_tx, stop_rx) = watch::channel(false);

    let server_ctx = Arc::new(net_server::ServerContext {
        tls_config: server_tls,
        bind_host: bind_host.unwrap_or_else(|| cfg.node.bind_host.clone()),
        port: cfg.node.listen_port,
        node_id: cfg.node.id.clone(),
        peers_by_id: ctx.peers_by_id().clone(),
        peers_by_fingerprint: ctx.peers_by_fingerprint().clone(),
        whitelist: cfg.security.fingerprint_whitelist.clone(),
        heartbeat_sec: cfg.connectivity.heartbeat_sec,
        connect_timeout_ms: cfg.connectivity.connect_timeout_ms,
    });
    let accept_handle = tokio::spawn(net_server::run_accept_loop(server_ctx, stop_rx.clone()));

    let mut connector_handles = Vec::new();
    for peer in &cfg.peers {
        let Some(state) = ctx.peer_by_id(&peer.id) else {
            continue;
        };
        let connector_cfg = net_client::ConnectorConfig {
            node_id: cfg.node.id.clone(),
            peer_id: peer.id.clone(),
            address: peer.addr.clone(),
            expected_fingerprint: peer.cert_fingerprint.clone(),
            whitelist: cfg.security.fingerprint_whitelist.clone(),
            shares: cfg.allowed_shares_for_peer(&peer.id),
            heartbeat_sec: cfg.connectivity.heartbeat_sec,
            connect_timeout_ms: cfg.connectivity.connect_timeout_ms,
            backoff: cfg.connectivity.backoff.clone(),
        };
        let client_tls = client_tls.clone();
        let stop_rx = stop_rx.clone();
        connector_handles.push(tokio::spawn(net_client::run_peer_connector(
            connector_cfg,
            client_tls,
            state,
            stop_rx,
        )));
    }

    let engine = build_engine(&cfg, client_tls.clone());
    let engine_handle = tokio::spawn(engine.clone().run_forever());

    let status_handle = if cfg.status_http.enabled {
        let host = cfg.status_http.host.clone();
        let port = status_port.unwrap_or(cfg.status_http.port);
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = crate::http::serve(ctx, &host, port).await {
                tracing::error!(error = %e, "status http server exited");
            }
        }))
    } else {
        None
    };

    if once_handshake {
        ctx.wait_all_handshakes().await;
        tracing::info!("all configured peers completed their initial handshake");
    } else {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    }

    let _ = stop_tx.send(true);
    engine.stop();
    let _ = accept_handle.await;
    for handle in connector_handles {
        let _ = handle.await;
    }
    let _ = engine_handle.await;
    if let Some(handle) = status_handle {
        handle.abort();
    }
    Ok(())
}

async fn cmd_send(config_path: &Path, peer: String, share: String, file: String) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, true)?;
    let (_server_tls, client_tls) = build_tls_configs(&cfg)?;
    let engine = build_engine(&cfg, client_tls);

    let task = engine.enqueue(&peer, &share, &file, "push").await?;
    println!("enqueued task {} ({} bytes)", task.task_id, task.total_bytes);

    let engine_for_run = engine.clone();
    let run_handle = tokio::spawn(engine_for_run.run_forever());

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let Some(current) = engine.get_task(task.task_id).await else {
            break;
        };
        println!(
            "task {}: {:?} ({}/{} bytes)",
            current.task_id, current.status, current.bytes_done, current.total_bytes
        );
        if current.is_terminal() {
            engine.stop();
            let _ = run_handle.await;
            if current.status == TaskStatus::Success {
                return Ok(());
            }
            return Err(KeyMeshError::Other(anyhow::anyhow!(
                "transfer ended in status {:?}",
                current.status
            )));
        }
    }
    Ok(())
}

async fn cmd_queue(config_path: &Path) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    let path = cfg.transfer.sessions_dir.join("queue.json");
    if !path.exists() {
        println!("[]");
        return Ok(());
    }
    let body = std::fs::read_to_string(&path)?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| KeyMeshError::Other(anyhow::anyhow!("malformed queue snapshot: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&value).expect("json value always renderable"));
    Ok(())
}

async fn cmd_cancel(config_path: &Path, task_id: u64) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    std::fs::create_dir_all(&cfg.transfer.sessions_dir)?;
    let flag = cfg.transfer.sessions_dir.join(format!("cancel_{task_id}.flag"));
    std::fs::write(flag, b"")?;
    println!("cancel flag written for task {task_id}");
    Ok(())
}

async fn cmd_peers(config_path: &Path) -> Result<(), KeyMeshError> {
    let cfg = config::load(config_path, false)?;
    let addr = format!("{}:{}", cfg.status_http.host, cfg.status_http.port);
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .map_err(|e| KeyMeshError::Other(anyhow::anyhow!("failed to reach status endpoint {addr}: {e}")))?;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!(
        "GET /peers HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        cfg.status_http.host
    );
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
    let value: serde_json::Value = serde_json::from_str(body.trim())
        .map_err(|e| KeyMeshError::Other(anyhow::anyhow!("malformed status response: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&value).expect("json value always renderable"));
    Ok(())
}

pub async fn run(cli: Cli) -> Result<(), KeyMeshError> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force).await,
        Command::Check => cmd_check(&cli.config).await,
        Command::ListShares => cmd_list_shares(&cli.config).await,
        Command::Manifest { share, out } => cmd_manifest(&cli.config, share, out).await,
        Command::Diff {
            peer,
            share,
            output,
            dry_run,
        } => cmd_diff(&cli.config, peer, share, output, dry_run).await,
        Command::Run {
            bind_host,
            status_port,
            once_handshake,
        } => cmd_run(&cli.config, bind_host, status_port, once_handshake).await,
        Command::Send { peer, share, file } => cmd_send(&cli.config, peer, share, file).await,
        Command::Queue => cmd_queue(&cli.config).await,
        Command::Cancel { task_id } => cmd_cancel(&cli.config, task_id).await,
        Command::Peers => cmd_peers(&cli.config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_init_note_falls_back_to_placeholder_when_file_absent() {
        let note = post_init_note();
        assert!(!note.is_empty());
    }
}
