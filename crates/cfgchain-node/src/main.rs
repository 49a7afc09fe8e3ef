//! Configuration chain node CLI
//!
//! Runs a local network of configuration chains over the in-memory board:
//! - DKG for one round across every node
//! - Threshold signature of a message by the qualified nodes
//! - Inspection of the per-node databases left behind

use anyhow::{bail, Context, Result};
use cfgchain_core::db::{Database, DbError, MemBackedDb};
use cfgchain_core::governance::{MemoryGovernance, MemoryNetwork};
use cfgchain_core::node_set::NodeSetCache;
use cfgchain_core::types::{Block, Position};
use cfgchain_core::{ConfigurationChain, DkgConfig, Hash, NodeSet, Round, Signer};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// Configuration chain node
#[derive(Parser)]
#[command(name = "cfgchain-node")]
#[command(about = "DKG and threshold signatures on a local network")]
#[command(version)]
struct Cli {
    /// Directory of the node databases
    #[arg(short, long, env = "CFGCHAIN_DEST", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a DKG round and sign a message with the group key
    Run {
        /// Number of nodes
        #[arg(short, long, default_value_t = 4)]
        nodes: usize,

        /// Polynomial degree; k+1 partial signatures recover a signature
        #[arg(short, long, default_value_t = 1)]
        threshold: usize,

        /// DKG timing unit in milliseconds
        #[arg(long, env = "CFGCHAIN_LAMBDA_MS", default_value_t = 200)]
        lambda_ms: u64,

        /// How long to wait for partial signatures, in milliseconds
        #[arg(long, default_value_t = 5000)]
        tsig_timeout_ms: u64,

        /// DKG round
        #[arg(short, long, default_value_t = 1)]
        round: Round,

        /// Message to sign; hashed with keccak256
        message: String,
    },

    /// Show what the node databases in `dest` hold
    Inspect,
}

/// One node of the local network
struct LocalNode {
    signer: Arc<Signer>,
    db: Arc<MemBackedDb>,
    chain: Arc<ConfigurationChain>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;

    match cli.command {
        Commands::Run {
            nodes,
            threshold,
            lambda_ms,
            tsig_timeout_ms,
            round,
            ref message,
        } => {
            let config = DkgConfig::new(Duration::from_millis(lambda_ms))
                .with_tsig_timeout(Duration::from_millis(tsig_timeout_ms));
            run_local(&cli.dest, nodes, threshold, round, config, message).await?;
        }
        Commands::Inspect => {
            inspect(&cli.dest)?;
        }
    }

    Ok(())
}

async fn run_local(
    dest: &Path,
    n: usize,
    threshold: usize,
    round: Round,
    config: DkgConfig,
    message: &str,
) -> Result<()> {
    if threshold + 1 > n {
        bail!("threshold {} needs at least {} nodes", threshold, threshold + 1);
    }

    let signers: Vec<Arc<Signer>> = (0..n).map(|_| Arc::new(Signer::generate())).collect();
    let node_set: NodeSet = signers.iter().map(|s| s.node_id()).collect();
    let gov = Arc::new(MemoryGovernance::new(node_set));
    let network = MemoryNetwork::new(gov.clone());

    let mut nodes = Vec::with_capacity(n);
    let mut dispatchers = Vec::with_capacity(n);
    for signer in signers {
        let path = dest.join(format!("node-{}.json", signer.node_id()));
        let db = Arc::new(MemBackedDb::open(&path).with_context(|| format!("opening {:?}", path))?);
        let (recv, inbox) = network.join(signer.clone());
        let chain = Arc::new(ConfigurationChain::new(
            signer.node_id(),
            Arc::new(recv),
            gov.clone(),
            Arc::new(NodeSetCache::new(gov.clone())),
            db.clone(),
            config.clone(),
        )?);
        dispatchers.push(inbox.spawn_dispatcher(chain.clone()));
        nodes.push(LocalNode { signer, db, chain });
    }

    info!(nodes = n, threshold, round, lambda = ?config.lambda, "Starting DKG");
    for node in &nodes {
        node.chain.register_dkg(round, threshold).await?;
    }
    let runs = nodes.iter().map(|node| {
        let chain = node.chain.clone();
        tokio::spawn(async move { chain.run_dkg(round).await })
    });
    for (node, result) in nodes.iter().zip(join_all(runs).await) {
        if let Err(e) = result? {
            warn!(node = %node.signer.node_id(), error = %e, "DKG failed");
        }
    }

    let qualified: Vec<&LocalNode> = nodes
        .iter()
        .filter(|node| node.chain.npks(round).is_some())
        .collect();
    let Some(npks) = qualified.first().and_then(|node| node.chain.npks(round)) else {
        bail!("no node qualified in round {}", round);
    };
    info!(
        qualified = qualified.len(),
        group_public_key = hex::encode(&npks.group_public_key),
        "DKG completed"
    );

    let hash = Hash::keccak256(message.as_bytes());
    let waiters: Vec<_> = qualified
        .iter()
        .map(|node| {
            let chain = node.chain.clone();
            tokio::spawn(async move { chain.run_tsig(round, hash).await })
        })
        .collect();
    for node in &qualified {
        let mut psig = node.chain.prepare_partial_signature(round, hash)?;
        node.signer.sign_partial_signature(&mut psig);
        network.broadcast_partial_signature(psig);
    }

    let mut signature = None;
    for (node, result) in qualified.iter().zip(join_all(waiters).await) {
        match result? {
            Ok(sig) => {
                append_block(node, hash, round)?;
                signature = Some(sig);
            }
            Err(e) => warn!(node = %node.signer.node_id(), error = %e, "TSIG failed"),
        }
    }
    let Some(signature) = signature else {
        bail!("no node recovered a threshold signature");
    };

    for error in network.dispatch_errors() {
        warn!(%error, "Rejected message");
    }
    for node in &nodes {
        node.db.close()?;
    }
    drop(nodes);
    for dispatcher in dispatchers {
        dispatcher.abort();
    }

    println!("Group Public Key: {}", hex::encode(&npks.group_public_key));
    println!("Message Hash: {}", hash);
    println!("Signature: {}", signature.to_hex());

    Ok(())
}

/// Record the signed message as the next compaction chain block
fn append_block(node: &LocalNode, hash: Hash, height: u64) -> Result<()> {
    let (parent_hash, _) = node.db.get_compaction_chain_tip_info();
    let block = Block {
        proposer_id: node.signer.node_id(),
        parent_hash,
        hash,
        position: Position { height },
        acks: Vec::new(),
    };
    match node.db.put_block(block) {
        Ok(()) | Err(DbError::BlockExists(_)) => {}
        Err(e) => return Err(e.into()),
    }
    node.db.put_compaction_chain_tip_info(hash, height)?;
    Ok(())
}

fn inspect(dest: &Path) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dest)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.starts_with("node-") && name.ends_with(".json")
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        println!("No node databases in {:?}", dest);
        return Ok(());
    }

    for path in paths {
        let db = MemBackedDb::open(&path).with_context(|| format!("opening {:?}", path))?;
        let mut blocks = db.get_all_blocks()?;
        let mut count = 0;
        loop {
            match blocks.next_block() {
                Ok(_) => count += 1,
                Err(DbError::IterationFinished) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let (tip, height) = db.get_compaction_chain_tip_info();

        println!("{}", path.display());
        println!("  DKG rounds: {:?}", db.dkg_rounds());
        println!("  Blocks: {}", count);
        println!("  Compaction tip: {} at height {}", tip, height);
    }

    Ok(())
}
