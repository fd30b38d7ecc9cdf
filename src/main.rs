use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mixnode::config::MixConfig;
use mixnode::devnet::Cluster;
use mixnode::mix::denom::{denominations_to_string, mask_of_amounts, split_amount, STANDARD_DENOMINATIONS};
use mixnode::mix::pool::now_millis;
use mixnode::node::{Clock, MixHandle, MixNode};
use mixnode::{format_money, Amount, COIN};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mixnode")]
#[command(about = "Masternode-coordinated coin mixing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run coordinators and participants in-process until sessions complete
    Simulate {
        #[arg(long, default_value = "1")]
        coordinators: usize,
        #[arg(long, default_value = "3")]
        participants: usize,
        /// Successful sessions to wait for
        #[arg(long, default_value = "1")]
        sessions: u64,
        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Split an amount into standard denominations
    Denominate {
        /// Amount in coins, e.g. 12.5
        #[arg(long)]
        amount: String,
        /// Restrict to these denominations
        #[arg(long, default_value = "0")]
        mask: u32,
    },

    /// Show the denominations named by a mask
    Decode {
        #[arg(long)]
        mask: u32,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mixnode=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate { coordinators, participants, sessions, timeout, config, seed } => {
            simulate(coordinators, participants, sessions, timeout, config, seed).await
        }
        Command::Denominate { amount, mask } => {
            let amount = parse_amount(&amount)?;
            let parts = split_amount(amount, mask);
            let used: Amount = parts.iter().sum();
            for value in &parts {
                println!("{}", format_money(*value));
            }
            println!("mask: {} ({})", mask_of_amounts(&parts), denominations_to_string(mask_of_amounts(&parts)));
            println!("left over: {}", format_money(amount - used));
            Ok(())
        }
        Command::Decode { mask } => {
            println!("{}", denominations_to_string(mask));
            Ok(())
        }
        Command::Config => {
            print!("{}", MixConfig::default().to_toml()?);
            Ok(())
        }
    }
}

fn parse_amount(s: &str) -> Result<Amount> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.starts_with('-') {
        bail!("amount must not be negative");
    }
    if frac.len() > 8 {
        bail!("at most 8 decimal places");
    }
    let whole: Amount = whole.parse()?;
    let frac: Amount = if frac.is_empty() { 0 } else { format!("{:0<8}", frac).parse()? };
    Ok(whole * COIN + frac)
}

async fn simulate(
    coordinators: usize,
    participants: usize,
    sessions: u64,
    timeout: u64,
    config: Option<PathBuf>,
    seed: Option<u64>,
) -> Result<()> {
    if coordinators == 0 {
        bail!("need at least one coordinator");
    }
    let mut config = match config {
        Some(path) => MixConfig::load(&path)?,
        None => MixConfig { tick_interval_ms: 200, auto_denominate_ticks: 1, ..MixConfig::default() },
    };
    if seed.is_some() {
        config.rng_seed = seed;
    }
    if participants < config.max_participants {
        bail!("{} participants cannot fill a session of {}", participants, config.max_participants);
    }

    // Every wallet gets two coins of each denomination plus change for collateral.
    let mut funding: Vec<Amount> = STANDARD_DENOMINATIONS.iter().chain(STANDARD_DENOMINATIONS.iter()).copied().collect();
    funding.extend([COIN / 10, COIN / 10, COIN / 10]);

    let cluster = Cluster::new(coordinators, participants, &funding, config);
    let chain = cluster.chain.clone();
    let clock = Clock::new(now_millis());

    let mut handles: Vec<MixHandle> = Vec::new();
    for node in cluster.into_nodes() {
        let (pool, link, inbox) = node.into_parts();
        let (node, handle) = MixNode::new(pool, link, inbox, clock);
        handles.push(handle);
        tokio::spawn(async move {
            if let Err(e) = node.run().await {
                tracing::error!("Node stopped: {}", e);
            }
        });
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let mut progress = tokio::time::interval(Duration::from_secs(1));
    let completed = loop {
        progress.tick().await;
        let done: u64 = handles[..coordinators].iter().map(|h| h.metrics().sessions_completed()).sum();
        if done >= sessions || tokio::time::Instant::now() >= deadline {
            break done;
        }
    };

    for handle in &handles {
        println!("{}", serde_json::to_string(&handle.status())?);
        handle.shutdown();
    }
    println!("mempool: {} transactions", chain.mempool().len());
    if completed < sessions {
        bail!("only {} of {} sessions completed within {}s", completed, sessions, timeout);
    }
    println!("{} sessions completed", completed);
    Ok(())
}
