// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use argh::FromArgs;
use dhcpd::configuration::{self, ServerConfig};
use dhcpd::server::Server;
use failure::{Error, ResultExt};

/// A small DHCPv4 server.
#[derive(Debug, FromArgs)]
#[argh(name = "dhcpd")]
pub struct Args {
    /// the path to the JSON configuration file; defaults are used when
    /// omitted
    #[argh(option)]
    pub config: Option<String>,

    /// adopt a local `.1` address as router and name server before serving
    #[argh(switch)]
    pub adjust_for_router: bool,

    /// log verbosity; repeat for more detail
    #[argh(option, default = "2")]
    pub verbosity: usize,
}

fn main() -> Result<(), Error> {
    let args: Args = argh::from_env();

    stderrlog::new()
        .verbosity(args.verbosity)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
        .context("failed to initialize logging")?;

    let mut config = match &args.config {
        Some(path) => configuration::load_server_config_from_file(path)?,
        None => ServerConfig::new(),
    };
    if args.adjust_for_router {
        config.adjust_if_this_computer_is_a_router();
    }
    log::info!(
        "serving network {} mask {} from host file {}",
        config.network,
        config.subnet_mask,
        config.host_file.display()
    );

    let mut server = Server::new(config).context("failed to start server")?;
    server.run();
    Ok(())
}
