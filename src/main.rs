use std::env;

use sqlgate_contracts::AskRequest;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "Usage:
  sqlgate serve --config <path>
  sqlgate ask --config <path> --role <role> [--sql <sql>] [--correlation-id <id>] <message...>
  sqlgate verify-audit <path> [--mirror <path>]";

const DEFAULT_CONFIG: &str = "./config/example-config.yaml";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    let rest: Vec<String> = args.collect();

    let code = match cmd.as_str() {
        "serve" => serve(&rest).await,
        "ask" => ask(&rest).await,
        "verify-audit" => verify_audit(&rest),
        _ => {
            eprintln!("{USAGE}");
            2
        }
    };
    std::process::exit(code);
}

fn load_config(path: &str) -> Result<sqlgate_config::Config, i32> {
    let cfg = sqlgate_config::load_and_validate(path).map_err(|e| {
        eprintln!("failed to load config: {e}");
        1
    })?;
    init_tracing(&cfg.logging.filter);
    Ok(cfg)
}

fn init_tracing(configured: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured));
    // Logs go to stderr so `ask` output stays machine-readable.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn serve(args: &[String]) -> i32 {
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            if let Some(v) = iter.next() {
                config_path = v.clone();
            }
        }
    }

    let cfg = match load_config(&config_path) {
        Ok(v) => v,
        Err(code) => return code,
    };
    tracing::info!(config = %config_path, "starting sqlgate");

    if let Err(e) = sqlgate_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        return 1;
    }
    0
}

async fn ask(args: &[String]) -> i32 {
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut role = None;
    let mut sql = None;
    let mut correlation_id = None;
    let mut words = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = iter.next() {
                    config_path = v.clone();
                }
            }
            "--role" => role = iter.next().cloned(),
            "--sql" => sql = iter.next().cloned(),
            "--correlation-id" => correlation_id = iter.next().cloned(),
            _ => words.push(arg.clone()),
        }
    }

    let Some(role) = role else {
        eprintln!("{USAGE}");
        return 2;
    };
    let cfg = match load_config(&config_path) {
        Ok(v) => v,
        Err(code) => return code,
    };

    let request = AskRequest {
        message: words.join(" "),
        role,
        sql,
        correlation_id,
    };
    match sqlgate_server::ask_once(cfg, request).await {
        Ok(response) => match serde_json::to_string_pretty(&response) {
            Ok(text) => {
                println!("{text}");
                0
            }
            Err(e) => {
                eprintln!("failed to encode response: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("ask failed: {e}");
            1
        }
    }
}

fn verify_audit(args: &[String]) -> i32 {
    let mut path = None;
    let mut mirror = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--mirror" {
            mirror = iter.next().cloned();
        } else if path.is_none() {
            path = Some(arg.clone());
        }
    }

    let Some(path) = path else {
        eprintln!("{USAGE}");
        return 2;
    };
    match sqlgate_server::verify_audit_chain_with_mirror(&path, mirror.as_deref()) {
        Ok(summary) => {
            println!("{summary}");
            0
        }
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            1
        }
    }
}
