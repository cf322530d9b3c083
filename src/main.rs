use anyhow::Context;
use clap::{Parser, Subcommand};
use dlimit::metrics::MetricsService;
use dlimit::{init_tracing, Decision, DlimitConfig, RateLimiterService};
use serde_json::json;
use std::path::PathBuf;
use std::process;

/// Operate distributed rate limit policies
#[derive(Debug, Parser)]
#[command(name = "dlimit", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "DLIMIT_CONFIG", default_value = "config/dlimit.yaml")]
    config: PathBuf,

    /// Redis URL, overriding the configured store
    #[arg(long, env = "DLIMIT_REDIS_URL")]
    redis_url: Option<String>,

    /// Print results and logs as JSON
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume from a policy for an identity
    Check {
        policy: String,
        identity: String,
        /// Number of consecutive checks
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Show the current counter
    Inspect { policy: String, identity: String },
    /// Forget all state for an identity
    Reset { policy: String, identity: String },
    /// Overwrite the counter
    Set {
        policy: String,
        identity: String,
        value: i64,
    },
    /// Credit the counter
    Add {
        policy: String,
        identity: String,
        amount: i64,
    },
    /// List configured policies
    Policies,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("dlimit error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Exit code 2 means the last check was denied
async fn run(cli: Cli) -> anyhow::Result<i32> {
    if cli.metrics && matches!(cli.command, Command::Policies) {
        anyhow::bail!("--metrics is not supported with `policies`");
    }

    let mut config = DlimitConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(url) = &cli.redis_url {
        config.override_store_url(url.clone());
    }
    config.validate()?;

    let metrics = if cli.metrics {
        Some(MetricsService::new()?)
    } else {
        None
    };

    if let Command::Policies = cli.command {
        print_policies(&config, cli.json)?;
        return Ok(0);
    }

    let service = RateLimiterService::connect(&config)
        .await
        .context("Failed to initialize rate limiter service")?;

    let mut code = 0;
    match cli.command {
        Command::Check {
            policy,
            identity,
            times,
        } => {
            for _ in 0..times.max(1) {
                let decision = service.check(&policy, &identity).await?;
                print_decision(&policy, &identity, &decision, cli.json);
                code = if decision.allowed { 0 } else { 2 };
            }
        }
        Command::Inspect { policy, identity } => {
            let value = service.inspect(&policy, &identity).await?;
            print_value(&policy, &identity, value, cli.json);
        }
        Command::Reset { policy, identity } => {
            service.reset(&policy, &identity).await?;
            if cli.json {
                println!("{}", json!({ "policy": policy, "identity": identity, "reset": true }));
            } else {
                println!("{} {}: reset", policy, identity);
            }
        }
        Command::Set {
            policy,
            identity,
            value,
        } => {
            service.set(&policy, &identity, value).await?;
            print_value(&policy, &identity, value, cli.json);
        }
        Command::Add {
            policy,
            identity,
            amount,
        } => {
            let value = service.add(&policy, &identity, amount).await?;
            print_value(&policy, &identity, value, cli.json);
        }
        Command::Policies => {}
    }

    if let Some(metrics) = metrics {
        print!("{}", metrics.render());
    }
    Ok(code)
}

fn print_decision(policy: &str, identity: &str, decision: &Decision, json: bool) {
    if json {
        println!(
            "{}",
            json!({ "policy": policy, "identity": identity, "decision": decision })
        );
    } else {
        let verdict = if decision.allowed { "allowed" } else { "denied" };
        println!(
            "{} {}: {} (remaining {})",
            policy, identity, verdict, decision.remaining
        );
    }
}

fn print_value(policy: &str, identity: &str, value: i64, json: bool) {
    if json {
        println!(
            "{}",
            json!({ "policy": policy, "identity": identity, "value": value })
        );
    } else {
        println!("{} {}: {}", policy, identity, value);
    }
}

fn print_policies(config: &DlimitConfig, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.policies)?);
        return Ok(());
    }

    for (name, policy) in &config.policies {
        println!("{}\t{}\t{}", name, policy.algorithm(), policy.key_prefix());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_metrics_flag_rejected_for_policies() {
        let cli = Cli::try_parse_from(["dlimit", "--metrics", "policies"]).unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(err.to_string().contains("--metrics"));
    }

    #[test]
    fn test_check_arguments() {
        let cli = Cli::try_parse_from(["dlimit", "check", "login", "alice", "--times", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Check { times: 3, .. }
        ));
    }
}
