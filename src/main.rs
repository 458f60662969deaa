// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use deposit_guardian::config::{GuardianConfig, LogFormat};
use deposit_guardian::node::run_guardian_node;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {}

#[tokio::main]
async fn main() {
    let _args = Args::parse();

    let config = match GuardianConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_logging(&config);

    let registry = prometheus::Registry::new();
    if let Err(e) = run_guardian_node(config, registry).await {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(config: &GuardianConfig) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Simple => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
