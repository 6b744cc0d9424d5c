use clap::{Args, Parser};
use proxy_harness::{
    Certificate, Context, Credentials, OriginServer, ProxyServer, Result,
    DEFAULT_HTTPS_PROXY_PORT, DEFAULT_HTTP_PROXY_PORT, DEFAULT_ORIGIN_PORT,
};
use std::{net::IpAddr, time::Duration};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Run the forward proxy test harness: a plain proxy, a TLS proxy and a TLS
/// origin, until Ctrl-C.
#[derive(Parser)]
#[clap(author, version, about)]
struct Opt {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, default_value = "info")]
    log: tracing::Level,

    /// Bind address
    #[clap(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Plain proxy port
    #[clap(long, default_value_t = DEFAULT_HTTP_PROXY_PORT)]
    http_port: u16,

    /// TLS proxy port
    #[clap(long, default_value_t = DEFAULT_HTTPS_PROXY_PORT)]
    https_port: u16,

    /// TLS origin port
    #[clap(long, default_value_t = DEFAULT_ORIGIN_PORT)]
    origin_port: u16,

    /// Hostname the self-signed certificates are issued for
    #[clap(long, default_value = "localhost")]
    hostname: String,

    /// Connection timeout in seconds
    #[clap(short = 'T', long, default_value = "10")]
    connect_timeout: u64,

    /// Listen backlog
    #[clap(short, long, default_value = "1024")]
    concurrent: u32,

    /// Seconds to wait for open connections on shutdown
    #[clap(long, default_value = "5")]
    shutdown_timeout: u64,

    /// Authentication type
    #[clap(flatten)]
    auth: AuthMode,
}

#[derive(Args, Clone)]
struct AuthMode {
    /// Authentication username
    #[clap(short, long, requires = "password")]
    username: Option<String>,

    /// Authentication password
    #[clap(short, long, requires = "username")]
    password: Option<String>,

    /// Realm advertised in the authentication challenge
    #[clap(long, default_value = "Proxy")]
    realm: String,
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    let filter = EnvFilter::default().add_directive(opt.log.into());
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(opt.log)
            .with_env_filter(filter)
            .finish(),
    )?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Connect timeout: {:?}s", opt.connect_timeout);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let ctx = Context {
        bind: opt.bind,
        concurrent: opt.concurrent,
        connect_timeout: Duration::from_secs(opt.connect_timeout),
        shutdown_timeout: Duration::from_secs(opt.shutdown_timeout),
        ..Context::default()
    };

    let with_auth = |proxy: ProxyServer| match (&opt.auth.username, &opt.auth.password) {
        (Some(username), Some(password)) => proxy.with_basic_auth_realm(
            &opt.auth.realm,
            Credentials::new(username.as_str(), password.as_str()),
        ),
        _ => proxy,
    };

    // One certificate per server instance.
    let http = with_auth(ProxyServer::plain(ctx.clone())).start(opt.http_port)?;
    let https = with_auth(ProxyServer::secure(
        ctx.clone(),
        Certificate::generate(&opt.hostname)?,
    ))
    .start(opt.https_port)?;
    let origin =
        OriginServer::new(ctx, Certificate::generate(&opt.hostname)?).start(opt.origin_port)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    for handle in [http, https, origin] {
        handle.close().await;
    }
    Ok(())
}
