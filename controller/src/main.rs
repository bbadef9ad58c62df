use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use is_terminal::IsTerminal;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use controller::*;

fn main() {
    use clap::{
        crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command,
        ValueHint,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run controllers").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("webhook_address")
                .long("webhook-bind-address")
                .help("address to bind for the conversion webhook server")
                .long_help(concat!(
                    "Address to bind for the conversion webhook server.\n",
                    "If there's a TLS certificate and key under the directory named by ",
                    "`TLS_SERVER_CERTS_DIR` then HTTPS will be served."
                ))
                .default_value("[::]:9443"),
            Arg::new("poll")
                .long("poll")
                .help("steady-state requeue interval, e.g. 10m or 30s")
                .default_value("10m"),
            Arg::new("poll_jitter_percentage")
                .long("poll-jitter-percentage")
                .help("percentage (0-99) the poll interval is jittered by")
                .default_value("10"),
            Arg::new("max_reconcile_rate")
                .long("max-reconcile-rate")
                .help("number of concurrent reconciles per controller")
                .default_value("10"),
            Arg::new("enable_management_policies")
                .long("enable-management-policies")
                .help("honor multi-action management policy sets")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool))
                .default_value("true"),
            Arg::new("sanitize_secrets")
                .long("sanitize-secrets")
                .help("redact Secret data mirrored into Object statuses")
                .action(ArgAction::SetTrue),
            Arg::new("enable_server_side_apply")
                .long("enable-server-side-apply")
                .help("use server-side apply instead of the last-applied annotation")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool))
                .default_value("true"),
            Arg::new("leader_elect")
                .long("leader-elect")
                .env("LEADER_ELECTION")
                .help("Flag for if leader election is needed. Handled by the manager harness.")
                .hide(true)
                .action(ArgAction::SetTrue),
            Arg::new("certs_dir")
                .long("certs-dir")
                .env("TLS_SERVER_CERTS_DIR")
                .help("directory containing a TLS cert+key pair for the webhook server")
                .value_hint(ValueHint::DirPath),
            Arg::new("controllers")
                .action(ArgAction::Append)
                .default_values(["object", "collection", "providerconfig"]),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(e),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    _leader_elect: bool,
    certs_dir: Option<PathBuf>,
    controllers: Vec<String>,
    introspection_address: SocketAddr,
    options: Options,
    webhook_address: SocketAddr,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        let poll = parse_duration(m.get_one::<String>("poll").unwrap())?;
        let jitter = m
            .get_one::<String>("poll_jitter_percentage")
            .unwrap()
            .parse::<u8>()
            .map_err(|err| Error::Config(format!("bad poll-jitter-percentage: {err}")))?;
        if jitter > 99 {
            return Err(Error::Config(
                "poll-jitter-percentage must be between 0 and 99".into(),
            ));
        }
        let rate = m
            .get_one::<String>("max_reconcile_rate")
            .unwrap()
            .parse::<u16>()
            .map_err(|err| Error::Config(format!("bad max-reconcile-rate: {err}")))?;
        Ok(Self {
            options: Options {
                poll,
                poll_jitter_percentage: jitter,
                max_reconcile_rate: rate,
                enable_management_policies: *m.get_one::<bool>("enable_management_policies").unwrap(),
                sanitize_secrets: m.get_flag("sanitize_secrets"),
                server_side_apply: *m.get_one::<bool>("enable_server_side_apply").unwrap(),
            },
            webhook_address: m.get_one::<String>("webhook_address").unwrap().parse()?,
            introspection_address: m
                .get_one::<String>("introspection_address")
                .unwrap()
                .parse()?,
            _leader_elect: m.get_flag("leader_elect"),
            controllers: m
                .get_many::<String>("controllers")
                .unwrap()
                .map(Clone::clone)
                .collect(),
            certs_dir: m.get_one::<String>("certs_dir").map(PathBuf::from),
        })
    }
}

/// Parse_duration accepts `90s`, `10m`, `1h`, and concatenations like
/// `1h30m`; a bare number is seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n = digits
            .parse::<u64>()
            .map_err(|err| Error::Config(format!("bad duration {s:?}: {err}")))?;
        digits.clear();
        total += match c {
            's' => Duration::from_secs(n),
            'm' => Duration::from_secs(n * 60),
            'h' => Duration::from_secs(n * 3600),
            other => {
                return Err(Error::Config(format!(
                    "bad duration {s:?}: unknown unit {other:?}"
                )))
            }
        };
    }
    if !digits.is_empty() {
        let n = digits
            .parse::<u64>()
            .map_err(|err| Error::Config(format!("bad duration {s:?}: {err}")))?;
        total += Duration::from_secs(n);
    }
    if total == Duration::ZERO {
        return Err(Error::Config(format!("bad duration {s:?}: zero")));
    }
    Ok(total)
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    {
        let addr = args.webhook_address;
        let certs = args.certs_dir.clone();
        let token = token.clone();
        rt.handle().spawn(async move {
            if let Err(e) = webhook::serve(addr, certs, token).await {
                error!("error from webhook server: {e}");
            }
        });
    }
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();

    info!(
        poll = ?args.options.poll,
        sanitize_secrets = args.options.sanitize_secrets,
        server_side_apply = args.options.server_side_apply,
        "setup done, starting controllers"
    );
    let ctx = Arc::new(Context::new(client, args.options.clone()));
    let mut ctrls = task::JoinSet::new();
    for name in &args.controllers {
        let fut = match name.to_lowercase().as_str() {
            "object" | "objects" => objects::controller(token.clone(), ctx.clone())?,
            "collection" | "collections" => collections::controller(token.clone(), ctx.clone())?,
            "providerconfig" | "providerconfigs" => {
                providerconfigs::controller(token.clone(), ctx.clone())?
            }
            other => {
                warn!(name = other, "unrecognized controller name, skipping");
                continue;
            }
        };
        ctrls.spawn(fut);
    }
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}
