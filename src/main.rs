use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LimiterConfig, TurnstileConfig};
use turnstile::ratelimit::{AdmissionResult, RateLimiter};

/// Replay admission checks against a set of configured limiters.
///
/// Reads one command per line from stdin and prints one JSON object per line:
///
///   check <limiter> <actor>
///   peek  <limiter> <actor>
///   reset <limiter> <actor>
#[derive(Parser, Debug)]
#[command(name = "turnstile", version)]
struct Args {
    /// Path to the limiter configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Reply<'a> {
    op: &'a str,
    limiter: &'a str,
    actor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<AdmissionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct Limiter {
    config: LimiterConfig,
    limiter: RateLimiter<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let storage = config.open_storage().await.context("opening storage")?;

    let mut limiters = HashMap::new();
    for limiter_config in &config.limiters {
        let limiter = limiter_config
            .build(storage.clone())
            .with_context(|| format!("building limiter {:?}", limiter_config.name))?;
        info!(
            name = %limiter_config.name,
            max = limiter.max(),
            window = ?limiter.window(),
            "Limiter ready"
        );
        limiters.insert(
            limiter_config.name.clone(),
            Limiter {
                config: limiter_config.clone(),
                limiter,
            },
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            signal = &mut shutdown => {
                signal.context("listening for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let reply = match words.as_slice() {
            [] => continue,
            [op, limiter, actor] => run(&limiters, op, limiter, actor).await,
            _ => {
                warn!(line = %line, "Expected: <check|peek|reset> <limiter> <actor>");
                continue;
            }
        };
        println!("{}", serde_json::to_string(&reply)?);
    }

    info!("Turnstile stopped");
    Ok(())
}

async fn run<'a>(
    limiters: &HashMap<String, Limiter>,
    op: &'a str,
    name: &'a str,
    actor: &'a str,
) -> Reply<'a> {
    let mut reply = Reply {
        op,
        limiter: name,
        actor,
        result: None,
        retry_after_secs: None,
        error: None,
    };

    let Some(entry) = limiters.get(name) else {
        reply.error = Some(format!("unknown limiter {:?}", name));
        return reply;
    };

    let actor = actor.to_string();
    let outcome = match op {
        "check" => entry
            .limiter
            .check_with_policy(&actor, entry.config.timeout(), entry.config.failure_policy)
            .await
            .map(Some),
        "peek" => entry.limiter.peek(&actor).await.map(Some),
        "reset" => entry.limiter.reset(&actor).await.map(|()| None),
        other => {
            reply.error = Some(format!("unknown operation {:?}", other));
            return reply;
        }
    };

    match outcome {
        Ok(Some(result)) => {
            reply.retry_after_secs = (!result.allowed).then(|| result.retry_after_secs());
            reply.result = Some(result);
        }
        Ok(None) => {}
        Err(e) => reply.error = Some(e.to_string()),
    }
    reply
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
