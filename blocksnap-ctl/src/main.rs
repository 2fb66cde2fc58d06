use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Value, json};

#[derive(Parser, Debug)]
#[command(name = "blocksnap-ctl")]
#[command(about = "Control the blocksnap snapshot daemon")]
struct Cli {
    /// Daemon control endpoint
    #[arg(long, env = "BLOCKSNAP_DAEMON", default_value = "http://127.0.0.1:3090")]
    daemon: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start snapshotting a mounted block device
    SetupSnapshot {
        /// Block device to track
        bdev: String,
        /// Path for the new COW file (must be on the tracked device)
        cow: String,
        /// Minor number for the tracer
        minor: u32,
        /// Space allocated to the COW file in megabytes (0 = default %)
        #[arg(short = 'f', long, default_value_t = 0)]
        fallocated_space: u64,
        /// Section cache size in bytes (0 = daemon default)
        #[arg(short = 'c', long, default_value_t = 0)]
        cache_size: u64,
    },
    /// Register an existing snapshot COW file for an unmounted device
    ReloadSnapshot {
        bdev: String,
        /// COW file path relative to the device's future mountpoint
        cow: String,
        minor: u32,
        #[arg(short = 'c', long, default_value_t = 0)]
        cache_size: u64,
    },
    /// Register an existing incremental COW index for an unmounted device
    ReloadIncremental {
        bdev: String,
        cow: String,
        minor: u32,
        #[arg(short = 'c', long, default_value_t = 0)]
        cache_size: u64,
    },
    /// Tear down a tracer and delete its COW file
    Destroy { minor: u32 },
    /// Switch an active snapshot to incremental tracking
    TransitionToIncremental { minor: u32 },
    /// Switch incremental tracking to a fresh snapshot
    TransitionToSnapshot {
        /// Path for the next generation's COW file
        cow: String,
        minor: u32,
        #[arg(short = 'f', long, default_value_t = 0)]
        fallocated_space: u64,
    },
    /// Change a tracer's section cache size
    Reconfigure {
        minor: u32,
        #[arg(short = 'c', long, default_value_t = 0)]
        cache_size: u64,
    },
    /// Show one tracer's state
    Info { minor: u32 },
    /// Print the smallest unused minor number
    GetFreeMinor,
}

enum Verb {
    Get,
    Post,
}

fn request_parts(command: &Command) -> (Verb, String, Option<Value>) {
    match command {
        Command::SetupSnapshot {
            bdev,
            cow,
            minor,
            fallocated_space,
            cache_size,
        } => (
            Verb::Post,
            "/v1/setup-snapshot".to_string(),
            Some(json!({
                "minor": minor,
                "bdev": bdev,
                "cow": cow,
                "fallocated_space": fallocated_space,
                "cache_size": cache_size,
            })),
        ),
        Command::ReloadSnapshot {
            bdev,
            cow,
            minor,
            cache_size,
        } => (
            Verb::Post,
            "/v1/reload-snapshot".to_string(),
            Some(json!({
                "minor": minor,
                "bdev": bdev,
                "cow": cow,
                "cache_size": cache_size,
            })),
        ),
        Command::ReloadIncremental {
            bdev,
            cow,
            minor,
            cache_size,
        } => (
            Verb::Post,
            "/v1/reload-incremental".to_string(),
            Some(json!({
                "minor": minor,
                "bdev": bdev,
                "cow": cow,
                "cache_size": cache_size,
            })),
        ),
        Command::Destroy { minor } => (Verb::Post, format!("/v1/destroy/{minor}"), None),
        Command::TransitionToIncremental { minor } => (
            Verb::Post,
            format!("/v1/transition-to-incremental/{minor}"),
            None,
        ),
        Command::TransitionToSnapshot {
            cow,
            minor,
            fallocated_space,
        } => (
            Verb::Post,
            "/v1/transition-to-snapshot".to_string(),
            Some(json!({
                "minor": minor,
                "cow": cow,
                "fallocated_space": fallocated_space,
            })),
        ),
        Command::Reconfigure { minor, cache_size } => (
            Verb::Post,
            "/v1/reconfigure".to_string(),
            Some(json!({ "minor": minor, "cache_size": cache_size })),
        ),
        Command::Info { minor } => (Verb::Get, format!("/v1/info/{minor}"), None),
        Command::GetFreeMinor => (Verb::Get, "/v1/free-minor".to_string(), None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (verb, path, body) = request_parts(&cli.command);
    let url = format!("{}{}", cli.daemon.trim_end_matches('/'), path);

    let client = reqwest::Client::new();
    let request = match verb {
        Verb::Get => client.get(&url),
        Verb::Post => {
            let request = client.post(&url);
            match body {
                Some(body) => request.json(&body),
                None => request,
            }
        }
    };

    let response = request
        .send()
        .await
        .with_context(|| format!("request to {url} failed; is blocksnapd running?"))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .unwrap_or_else(|_| json!({ "message": "no response body" }));

    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        eprintln!("{}", "ok".green());
        Ok(())
    } else {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let code = payload.get("error").and_then(Value::as_i64).unwrap_or(0);
        eprintln!("{} {message} (errno {code})", "error:".red());
        bail!("daemon returned {status}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_targets_minor_path() {
        let (verb, path, body) = request_parts(&Command::Destroy { minor: 7 });
        assert!(matches!(verb, Verb::Post));
        assert_eq!(path, "/v1/destroy/7");
        assert!(body.is_none());
    }

    #[test]
    fn setup_snapshot_body_carries_all_fields() {
        let (_, path, body) = request_parts(&Command::SetupSnapshot {
            bdev: "/dev/sda1".to_string(),
            cow: "/mnt/a/cow.snap".to_string(),
            minor: 0,
            fallocated_space: 512,
            cache_size: 1024,
        });
        assert_eq!(path, "/v1/setup-snapshot");
        let body = body.unwrap();
        assert_eq!(body["bdev"], "/dev/sda1");
        assert_eq!(body["cow"], "/mnt/a/cow.snap");
        assert_eq!(body["minor"], 0);
        assert_eq!(body["fallocated_space"], 512);
        assert_eq!(body["cache_size"], 1024);
    }

    #[test]
    fn info_is_a_get() {
        let (verb, path, body) = request_parts(&Command::Info { minor: 3 });
        assert!(matches!(verb, Verb::Get));
        assert_eq!(path, "/v1/info/3");
        assert!(body.is_none());
    }
}
