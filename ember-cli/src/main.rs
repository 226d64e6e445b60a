#![forbid(unsafe_code)]

//! Thin front end: parse flags, start the client, watch scripts, report
//! tip changes until interrupted.

use std::path::PathBuf;

use clap::Arg;
use tracing_subscriber::EnvFilter;

use ember_electrum::chain::{Coin, NetType};
use ember_electrum::config::ServerAddr;
use emberlib::{EmberClient, EmberConfig, StaticKeySource};

fn build_clap_app() -> clap::ArgMatches {
    clap::Command::new("ember")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Light wallet client for ElectrumX-indexed chains")
        .arg(
            Arg::new("coin")
                .long("coin")
                .value_name("TICKER")
                .help("Coin to run against: btc, dash or firo")
                .default_value("btc"),
        )
        .arg(
            Arg::new("net")
                .long("net")
                .value_name("NET")
                .help("mainnet, testnet or regtest")
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .value_name("URL")
                .help("Trusted ElectrumX server, e.g. ssl://host:50002")
                .required(true),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Base data directory")
                .default_value(".ember"),
        )
        .arg(
            Arg::new("proxy-port")
                .long("proxy-port")
                .value_name("PORT")
                .help("Local socks5 port for onion servers")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("no-verify-tls")
                .long("no-verify-tls")
                .help("Accept self-signed server certificates (dev servers)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .value_name("SCRIPT_HEX")
                .help("Output script to watch; may be given multiple times")
                .action(clap::ArgAction::Append),
        )
        .get_matches()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    // install default crypto provider (ring)
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Error installing crypto provider: {e:?}");
    }

    let matches = build_clap_app();
    let coin: Coin = match matches.get_one::<String>("coin").unwrap().parse() {
        Ok(coin) => coin,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let net: NetType = match matches.get_one::<String>("net").unwrap().parse() {
        Ok(net) => net,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let server: ServerAddr = match matches.get_one::<String>("server").unwrap().parse() {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let data_dir = PathBuf::from(matches.get_one::<String>("data-dir").unwrap());

    let mut config = EmberConfig::new(coin, net, data_dir, server);
    config.proxy_port = matches.get_one::<u16>("proxy-port").copied();
    config.skip_tls_verify = matches.get_flag("no-verify-tls");

    let watches: Vec<Vec<u8>> = matches
        .get_many::<String>("watch")
        .unwrap_or_default()
        .map(|script| match hex::decode(script) {
            Ok(script) => script,
            Err(e) => {
                eprintln!("bad --watch script '{script}': {e}");
                std::process::exit(1);
            }
        })
        .collect();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(run(config, watches)) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: EmberConfig, watches: Vec<Vec<u8>>) -> Result<(), emberlib::ClientError> {
    let keys = StaticKeySource {
        external: watches
            .iter()
            .enumerate()
            .map(|(i, script)| (script.clone(), format!("watch-{i}")))
            .collect(),
        internal: Vec::new(),
    };
    let client = EmberClient::start(config, Box::new(keys)).await?;
    tracing::info!(
        "connected; chain tip {} (synced: {})",
        client.tip().await,
        client.synced().await
    );

    for (i, script) in watches.iter().enumerate() {
        let status = client.watch_script(script, &format!("watch-{i}")).await?;
        tracing::info!("watching script {i}, status '{status}'");
    }
    client.sync_wallet()?;

    let mut tips = client.tip_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = tips.changed() => {
                if changed.is_err() {
                    break;
                }
                let tip = *tips.borrow_and_update();
                let balance = client.balance().await;
                tracing::info!(
                    "tip {tip}; balance confirmed {} unconfirmed {} locked {}",
                    balance.confirmed,
                    balance.unconfirmed,
                    balance.locked
                );
            }
        }
    }

    tracing::info!("shutting down");
    client.stop().await;
    Ok(())
}
