use anyhow::{bail, Context as _};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use scoped_context::{ContextConfig, ContextLifecycle, ManualClock, ScopeType};
use scoped_store::{
    BeanIdentifier, Contextual, CreationError, CreationalContext, DestructionError, Instance,
    MemoryRequest, MemorySession, RequestHost,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Wizard page state kept in the conversation
#[derive(Debug, Default)]
struct WizardStep {
    destroyed: AtomicUsize,
}

impl Contextual for WizardStep {
    fn identifier(&self) -> BeanIdentifier {
        BeanIdentifier::new("wizard.Step")
    }

    fn create(&self, _creational: &mut CreationalContext) -> Result<Instance, CreationError> {
        Ok(Arc::new(Vec::<String>::new()))
    }

    fn destroy(
        &self,
        _instance: &Instance,
        _creational: &CreationalContext,
    ) -> Result<(), DestructionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ContentionReport {
    conversation: String,
    tabs: usize,
    hold_ms: u64,
    wait_ms: u64,
    acquired: usize,
    busy: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct ExpiryReport {
    conversation: String,
    timeout_ms: u64,
    idle_ms: u64,
    resumed: bool,
    nonexistent: bool,
    instances_destroyed: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Command::new("scoped-sim")
        .version(scoped_context::VERSION)
        .about("Exercise scoped contexts against in-memory requests and sessions")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("TOML context configuration"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Several tabs resume one conversation at once")
                .arg(
                    Arg::new("tabs")
                        .long("tabs")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Concurrent requests propagating the same id"),
                )
                .arg(
                    Arg::new("hold-ms")
                        .long("hold-ms")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("How long each request keeps the conversation"),
                )
                .arg(
                    Arg::new("wait-ms")
                        .long("wait-ms")
                        .value_parser(value_parser!(u64))
                        .help("Bounded lock wait, overrides the configuration"),
                ),
        )
        .subcommand(
            Command::new("expire")
                .about("Resume a conversation after it has been idle")
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .default_value("1000")
                        .value_parser(value_parser!(u64))
                        .help("Conversation timeout"),
                )
                .arg(
                    Arg::new("idle-ms")
                        .long("idle-ms")
                        .default_value("2000")
                        .value_parser(value_parser!(u64))
                        .help("Idle time between the two requests"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"));

    let matches = cli.get_matches();
    init_tracing(matches.get_flag("json-logs"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let tabs = args.get_one::<usize>("tabs").copied().unwrap_or(4);
            let hold_ms = args.get_one::<u64>("hold-ms").copied().unwrap_or(200);
            let config = match args.get_one::<u64>("wait-ms") {
                Some(wait) => config.with_concurrent_access_timeout_ms(*wait),
                None => config,
            };
            let report = simulate(&config, tabs, hold_ms)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(("expire", args)) => {
            let timeout_ms = args.get_one::<u64>("timeout-ms").copied().unwrap_or(1000);
            let idle_ms = args.get_one::<u64>("idle-ms").copied().unwrap_or(2000);
            let report = expire(config, timeout_ms, idle_ms)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(("config", _)) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => bail!("no subcommand given, see --help"),
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<ContextConfig> {
    let Some(path) = matches.get_one::<String>("config") else {
        return Ok(ContextConfig::new());
    };
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    ContextConfig::from_toml_str(&source).with_context(|| format!("parsing {path}"))
}

fn propagating(session: &Arc<MemorySession>, parameter: &str, cid: &str) -> Arc<dyn RequestHost> {
    Arc::new(
        MemoryRequest::new()
            .with_session(Arc::clone(session))
            .with_parameter(parameter, cid),
    )
}

fn simulate(config: &ContextConfig, tabs: usize, hold_ms: u64) -> anyhow::Result<ContentionReport> {
    let session = MemorySession::new();
    let wizard: Arc<dyn Contextual> = Arc::new(WizardStep::default());

    let cid = {
        let mut lifecycle = ContextLifecycle::new(config.clone());
        let request: Arc<dyn RequestHost> =
            Arc::new(MemoryRequest::new().with_session(Arc::clone(&session)));
        let mut scope = lifecycle.begin_request(&request);
        let cid = scope.conversation().begin(None)?;
        scope.get_or_create(ScopeType::Conversation, &wizard)?;
        cid
    };
    tracing::info!(conversation = %cid, tabs, "conversation started, resuming from all tabs");

    let started = Instant::now();
    let handles: Vec<_> = (0..tabs)
        .map(|tab| {
            let config = config.clone();
            let session = Arc::clone(&session);
            let wizard = Arc::clone(&wizard);
            let cid = cid.clone();
            thread::spawn(move || {
                let mut lifecycle = ContextLifecycle::new(config.clone());
                let request = propagating(&session, &config.parameter_name, &cid);
                let mut scope = lifecycle.begin_request(&request);
                if let Some(err) = scope.activation_error() {
                    tracing::info!(tab, "request rejected: {}", err);
                    return false;
                }
                let acquired = scope.get_or_create(ScopeType::Conversation, &wizard).is_ok();
                thread::sleep(Duration::from_millis(hold_ms));
                acquired
            })
        })
        .collect();

    let mut acquired = 0;
    for handle in handles {
        match handle.join() {
            Ok(true) => acquired += 1,
            Ok(false) => {}
            Err(_) => bail!("tab thread panicked"),
        }
    }

    Ok(ContentionReport {
        conversation: cid,
        tabs,
        hold_ms,
        wait_ms: config.concurrent_access_timeout_ms,
        acquired,
        busy: tabs - acquired,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

fn expire(config: ContextConfig, timeout_ms: u64, idle_ms: u64) -> anyhow::Result<ExpiryReport> {
    let clock = Arc::new(ManualClock::new(0));
    let parameter = config.parameter_name.clone();
    let mut lifecycle = ContextLifecycle::new(config).with_clock(clock.clone());
    let session = MemorySession::new();
    let step = Arc::new(WizardStep::default());
    let wizard: Arc<dyn Contextual> = step.clone();

    let cid = {
        let request: Arc<dyn RequestHost> =
            Arc::new(MemoryRequest::new().with_session(Arc::clone(&session)));
        let mut scope = lifecycle.begin_request(&request);
        scope.conversation().set_timeout_ms(timeout_ms);
        let cid = scope.conversation().begin(None)?;
        scope.get_or_create(ScopeType::Conversation, &wizard)?;
        cid
    };

    clock.advance(idle_ms);

    let request = propagating(&session, &parameter, &cid);
    let scope = lifecycle.begin_request(&request);
    let (resumed, nonexistent) = match scope.activation_error() {
        None => (true, false),
        Some(err) => (false, err.is_nonexistent()),
    };
    drop(scope);

    Ok(ExpiryReport {
        conversation: cid,
        timeout_ms,
        idle_ms,
        resumed,
        nonexistent,
        instances_destroyed: step.destroyed.load(Ordering::SeqCst),
    })
}
