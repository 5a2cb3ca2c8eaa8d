use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use netplug::bootstrap::{BehaviorSpec, Plug};
use netplug::plug::dump::dump_sink_for;
use netplug::plug::feed::FeedOptions;
use netplug::plug::operator_prompt::StdinPrompt;
use netplug::plug::peer::Transport;
use netplug::plug::plug_config::{default_blit_addr, resolve_addr, DumpFormat, LogConfig, OutputTarget, PlugConfig, TlsOptions, DEFAULT_BLIT_IPADDR, DEFAULT_LISTEN_IPADDR};
use netplug::plug::shutdown::{Shutdown, StopReason};
use tracing::{debug, info, warn, Level};

/// Replays a feed of messages to whoever talks to it, or relays between its peers
#[derive(Parser)]
struct Args {
    /// host:port to connect to (omit with --listen); a bare port means localhost
    target: Option<String>,

    /// run as a server on host:port, or on all interfaces if only a port is given
    #[clap(short, long)]
    listen: Option<String>,

    /// local host:port a client connects from
    #[clap(short, long)]
    source: Option<String>,

    /// host:port of the Blit control listener; a bare port means localhost
    #[clap(short, long)]
    blit: Option<String>,

    /// do not accept Blit commands over UDP
    #[clap(long, default_value_t = false)]
    blit_tcp_only: bool,

    #[clap(short, long, default_value_t = false)]
    udp: bool,

    /// send the first feed message without waiting for data
    #[clap(short, long, default_value_t = false)]
    initiate: bool,

    /// close the connection after the last feed message
    #[clap(short, long, default_value_t = false)]
    end: bool,

    /// wait for [enter] before each feed message
    #[clap(long, default_value_t = false)]
    step: bool,

    /// reconnect whenever the connection is lost
    #[clap(short, long, default_value_t = false)]
    reconnect: bool,

    #[clap(short, long, default_value_t = false)]
    quiet: bool,

    #[clap(short = 'Q', long, default_value_t = false)]
    squelch_exhausted: bool,

    /// hex, raw or off
    #[clap(short, long, default_value = "hex")]
    dump_format: String,

    /// write log and dumps to this file instead of stderr
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// raw message file, one message per file; repeat for a sequence
    #[clap(short, long)]
    from_file: Vec<PathBuf>,

    /// relay between peers instead of replaying a feed
    #[clap(long, default_value_t = false)]
    relay: bool,

    /// wrap TCP connections in TLS
    #[clap(long, default_value_t = false)]
    tls: bool,

    /// PEM certificate chain of a TLS server
    #[clap(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// PEM private key of a TLS server
    #[clap(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// PEM CA certificates a TLS client verifies the server against; without them, any
    ///  server certificate is accepted
    #[clap(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// server name a TLS client asks for (defaults to the target address)
    #[clap(long, requires = "tls")]
    tls_name: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log = match log_config(&args) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&log) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(args, log));
    // a pending operator prompt keeps a blocking read on stdin
    runtime.shutdown_background();

    match result {
        Ok(reason) => {
            debug!("stopped: {}", reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn log_config(args: &Args) -> anyhow::Result<LogConfig> {
    let dump_format = if args.dump_format.eq_ignore_ascii_case("off") {
        None
    }
    else {
        Some(args.dump_format.parse::<DumpFormat>()?)
    };

    Ok(LogConfig {
        verbose: !args.quiet,
        dump_format,
        output: match &args.output {
            None => OutputTarget::Stderr,
            Some(path) => OutputTarget::File(path.clone()),
        },
    })
}

fn init_logging(log: &LogConfig) -> anyhow::Result<()> {
    let level = if log.verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level);

    match &log.output {
        OutputTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        OutputTarget::Stdout => builder.with_writer(std::io::stdout).try_init(),
        OutputTarget::File(path) => {
            let file = File::options().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    }.map_err(|e| anyhow!("cannot install log subscriber: {}", e))
}

async fn plug_config(args: &Args, log: LogConfig) -> anyhow::Result<PlugConfig> {
    let transport = if args.udp { Transport::Udp } else { Transport::Tcp };

    let mut config = match (&args.listen, &args.target) {
        (Some(listen), None) => PlugConfig::server(transport, resolve_addr(listen, DEFAULT_LISTEN_IPADDR).await?),
        (None, Some(target)) => {
            let mut config = PlugConfig::client(transport, resolve_addr(target, DEFAULT_BLIT_IPADDR).await?);
            if let Some(source) = &args.source {
                config.local_addr = Some(resolve_addr(source, DEFAULT_LISTEN_IPADDR).await?);
            }
            config
        }
        (Some(_), Some(_)) => bail!("a listening plug has no target"),
        (None, None) => bail!("missing target address (or --listen)"),
    };

    config.blit_addr = match &args.blit {
        Some(blit) => resolve_addr(blit, DEFAULT_BLIT_IPADDR).await?,
        None => default_blit_addr(),
    };
    config.blit_udp = !args.blit_tcp_only;
    config.persist = args.reconnect;
    config.feed_options = FeedOptions {
        step: args.step,
        go_first: args.initiate,
        close_at_end: args.end,
        squelch_exhausted: args.squelch_exhausted,
    };
    config.log = log;
    if args.tls {
        config.tls = Some(TlsOptions {
            cert_chain: args.tls_cert.clone(),
            private_key: args.tls_key.clone(),
            ca_certs: args.tls_ca.clone(),
            server_name: args.tls_name.clone(),
        });
    }
    Ok(config)
}

fn behavior(args: &Args) -> anyhow::Result<BehaviorSpec> {
    if args.relay {
        if !args.from_file.is_empty() {
            bail!("a relay does not replay feed files");
        }
        return Ok(BehaviorSpec::Relay);
    }

    let mut messages = Vec::new();
    for path in &args.from_file {
        let data = std::fs::read(path)
            .map_err(|e| anyhow!("cannot read {:?}: {}", path, e))?;
        messages.push(Bytes::from(data));
    }
    if messages.is_empty() {
        warn!("the feed is empty");
    }
    Ok(BehaviorSpec::Feed(messages.into()))
}

async fn run(args: Args, log: LogConfig) -> anyhow::Result<StopReason> {
    let config = plug_config(&args, log).await?;
    let behavior = behavior(&args)?;
    let dump = Arc::from(dump_sink_for(&config.log)?);

    let shutdown = Shutdown::new();
    let plug = Plug::start(config, behavior, dump, Arc::new(StdinPrompt::default()), shutdown.clone()).await?;
    info!("Blit control listener at {}", plug.blit_addr());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger(StopReason::Interrupted);
        }
    });

    plug.run().await
}
