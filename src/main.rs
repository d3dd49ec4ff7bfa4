use std::{
    fmt::Write as _,
    io::Read as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use reqscope::{
    capture::CaptureStatus,
    codec::{ParsedRequest, try_parse_raw_request},
    config::Config,
    event_log::EventLog,
    filter::{RequestFilter, SortOrder, collect_hosts, format_size},
    inspector::Inspector,
    logging,
    model::{ContextId, RequestRecord, RequestSummary},
    replay::{ReplayDispatcher, ReplayOutcome, ReplayResult},
    transport::HyperTransport,
};

#[derive(Debug, Parser)]
#[command(name = "reqscope")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args, Clone, PartialEq, Eq, Default)]
struct CommonArgs {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse raw request text and print it as JSON.
    Parse {
        /// File holding the raw request, or `-` for stdin.
        input: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Send raw request text and print the raw response.
    Send {
        /// File holding the raw request, or `-` for stdin.
        input: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Feed a recorded event log through the capture pipeline and show the history.
    Inspect {
        #[command(flatten)]
        args: InspectArgs,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Args, Clone, PartialEq, Eq)]
struct InspectArgs {
    /// JSON Lines event log.
    events: PathBuf,
    /// Context to show; defaults to the first context in the log.
    #[arg(long)]
    context: Option<u64>,
    /// Print the full record for one request id.
    #[arg(long)]
    detail: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long = "type")]
    resource_type: Option<String>,
    #[arg(long)]
    method: Option<String>,
    #[arg(long)]
    host: Option<String>,
    /// List the oldest requests first instead of the newest.
    #[arg(long)]
    oldest_first: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum CommandOutcome {
    Parsed(ParsedRequest),
    Replayed(ReplayResult),
    Listed {
        context: ContextId,
        status: CaptureStatus,
        requests: Vec<RequestSummary>,
        hosts: Vec<String>,
    },
    Detail(Box<RequestRecord>),
}

fn read_input(input: &Path) -> anyhow::Result<String> {
    if input.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read request from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(input).with_context(|| format!("read request {}", input.display()))
}

fn run_parse(raw: &str) -> anyhow::Result<CommandOutcome> {
    let parsed = try_parse_raw_request(raw).context("cannot parse request")?;
    Ok(CommandOutcome::Parsed(parsed))
}

async fn run_send(config: &Config, raw: &str) -> anyhow::Result<CommandOutcome> {
    let parsed = try_parse_raw_request(raw).context("cannot parse request")?;
    let dispatcher = ReplayDispatcher::new(HyperTransport::new()?, config.host_mismatch_policy());
    match dispatcher.dispatch(&parsed).await {
        ReplayOutcome::Completed(result) => Ok(CommandOutcome::Replayed(result)),
        ReplayOutcome::Failed { message } => bail!("{message}"),
    }
}

async fn run_inspect(config: &Config, args: InspectArgs) -> anyhow::Result<CommandOutcome> {
    let log = EventLog::load(&args.events)?;
    let contexts = log.contexts();
    let context = match args.context {
        Some(context) => ContextId(context),
        None => contexts.first().copied().unwrap_or(ContextId(0)),
    };
    let (events, channel) = log.into_parts();
    let inspector = Inspector::new(channel, HyperTransport::new()?, config);

    for &context in &contexts {
        let outcome = inspector.capture().attach(context).await;
        if !outcome.success {
            bail!(
                "attach context {context}: {}",
                outcome.error.unwrap_or_default()
            );
        }
    }
    for event in events {
        inspector.capture().handle_event(event.context, event.event).await;
    }

    if let Some(request_id) = args.detail {
        let record = inspector
            .capture()
            .request_detail(context, &request_id)
            .with_context(|| format!("request `{request_id}` not found in context {context}"))?;
        return Ok(CommandOutcome::Detail(Box::new(record)));
    }

    let filter = RequestFilter {
        search: args.search,
        resource_type: args.resource_type,
        method: args.method,
        host: args.host,
        order: if args.oldest_first {
            SortOrder::OldestFirst
        } else {
            SortOrder::NewestFirst
        },
    };
    let all = inspector.capture().requests(context);
    let hosts = collect_hosts(&all);
    let requests = filter.apply(&all).into_iter().cloned().collect();
    Ok(CommandOutcome::Listed {
        context,
        status: inspector.capture().status(context),
        requests,
        hosts,
    })
}

fn render_outcome(outcome: &CommandOutcome) -> anyhow::Result<String> {
    let rendered = match outcome {
        CommandOutcome::Parsed(parsed) => {
            serde_json::to_string_pretty(parsed).context("serialize parsed request")?
        }
        CommandOutcome::Replayed(result) => result.raw_response.clone(),
        CommandOutcome::Detail(record) => {
            serde_json::to_string_pretty(record).context("serialize request record")?
        }
        CommandOutcome::Listed {
            context,
            status,
            requests,
            hosts,
        } => {
            let mut out = String::new();
            writeln!(
                out,
                "context {context}: {} shown of {} captured",
                requests.len(),
                status.request_count
            )?;
            for request in requests {
                let status_label = match (request.failed, request.status) {
                    (true, _) => "ERR".to_owned(),
                    (false, Some(status)) => status.to_string(),
                    (false, None) => "-".to_owned(),
                };
                writeln!(
                    out,
                    "{}  {:<7} {:>3}  {:>9}  {}  {}",
                    request.formatted_time,
                    request.method,
                    status_label,
                    format_size(request.response_size),
                    request.id,
                    request.url
                )?;
            }
            if !hosts.is_empty() {
                writeln!(out, "hosts: {}", hosts.join(", "))?;
            }
            out.trim_end().to_owned()
        }
    };
    Ok(rendered)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Parse { input, common } => {
            let config = Config::load(common.config.as_deref())?;
            logging::init(&config, common.log_level.as_deref())?;
            run_parse(&read_input(&input)?)?
        }
        Command::Send { input, common } => {
            let config = Config::load(common.config.as_deref())?;
            logging::init(&config, common.log_level.as_deref())?;
            let outcome = run_send(&config, &read_input(&input)?).await?;
            if let CommandOutcome::Replayed(result) = &outcome {
                eprintln!(
                    "status={} elapsed_ms={} size={}",
                    result.response.status,
                    result.elapsed_ms,
                    format_size(Some(result.response_size as u64))
                );
            }
            outcome
        }
        Command::Inspect { args, common } => {
            let config = Config::load(common.config.as_deref())?;
            logging::init(&config, common.log_level.as_deref())?;
            run_inspect(&config, args).await?
        }
    };
    println!("{}", render_outcome(&outcome)?);

    Ok(())
}
