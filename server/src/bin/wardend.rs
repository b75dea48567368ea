// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run wardend, the warden dispatch server.

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use warden_server::start_server;
use warden_server::Config;

#[derive(Debug, Parser)]
#[clap(name = "wardend", about = "Warden authorization dispatch server")]
enum Args {
    /// Start a warden server
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(error) = do_run().await {
        eprintln!("wardend: {:#}", error);
        std::process::exit(1);
    }
}

async fn do_run() -> anyhow::Result<()> {
    let Args::Run { config_file_path } = Args::parse();
    let config = Config::from_file(&config_file_path)
        .with_context(|| format!("loading config from {config_file_path}"))?;
    let server = start_server(config)
        .await
        .map_err(|message| anyhow!("starting server: {}", message))?;
    server
        .wait_for_finish()
        .await
        .map_err(|message| anyhow!("server failed: {}", message))
}
