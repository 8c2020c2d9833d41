use async_trait::async_trait;
use mercurial_browser::analysis::{
    AiBoundary, AiError, ContentAnalyzer, DispatchOutcome, Generation, GenerativeBackend,
    GroundingChunk,
};
use mercurial_browser::core::{FrameAccessError, HeadlessView};
use mercurial_browser::{BrowserConfig, BrowserSession};
use std::env;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone)]
struct AppConfig {
    url: Option<String>,
    config_path: Option<String>,
    offline: bool,
    log_level: Level,
}

impl AppConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--url" => {
                    if i + 1 < args.len() {
                        config.url = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--config" => {
                    if i + 1 < args.len() {
                        config.config_path = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--offline" => config.offline = true,
                "--debug" => config.log_level = Level::DEBUG,
                "--trace" => config.log_level = Level::TRACE,
                _ => {}
            }
            i += 1;
        }

        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: None,
            config_path: None,
            offline: false,
            log_level: Level::INFO,
        }
    }
}

/// Answers from the prompt alone so the shell works without an API key.
struct OfflineBackend;

#[async_trait]
impl GenerativeBackend for OfflineBackend {
    async fn generate(&self, prompt: &str) -> Result<Generation, AiError> {
        let uri = prompt
            .split_whitespace()
            .find(|word| word.starts_with("http"))
            .map(|word| word.trim_end_matches(['.', ',']).to_string());

        Ok(Generation {
            text: format!("[offline] {prompt}"),
            grounding: uri
                .map(|uri| {
                    vec![GroundingChunk {
                        uri: Some(uri),
                        title: None,
                    }]
                })
                .unwrap_or_default(),
        })
    }
}

fn setup_logging(level: Level) {
    // RUST_LOG, when set, overrides the command-line level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

const HELP: &str = "\
commands:
  go <url>         navigate (scheme defaults to https://)
  back | forward   move through history
  refresh          reload the current page
  load [url]       view finished loading, optionally somewhere else
  blocked          view finished loading, location unreadable
  instruct <text>  set the analysis instruction
  summarize        summarize the current page
  extract          extract the current page's text
  panel            toggle the assistant panel
  history          list history entries
  status           print the session snapshot as JSON
  quit";

async fn run_command(session: &BrowserSession, view: &HeadlessView, line: &str) -> bool {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "go" => {
            if !session.submit_url(arg).await {
                println!("(no navigation)");
            }
        }
        "back" => {
            if !session.go_back().await {
                println!("(no back history)");
            }
        }
        "forward" => {
            if !session.go_forward().await {
                println!("(no forward history)");
            }
        }
        "refresh" => session.refresh().await,
        "load" => {
            if arg.is_empty() {
                view.complete_in_place();
            } else {
                view.complete_load(Ok(arg.to_string()));
            }
        }
        "blocked" => {
            view.complete_load(Err(FrameAccessError::CrossOrigin));
        }
        "instruct" => session.set_instruction(arg).await,
        "summarize" => print_outcome(session, session.request_summary().await).await,
        "extract" => print_outcome(session, session.request_extraction().await).await,
        "panel" => {
            let open = session.toggle_panel().await;
            println!("panel {}", if open { "open" } else { "closed" });
        }
        "history" => {
            let snapshot = session.snapshot().await;
            for (i, url) in snapshot.history.iter().enumerate() {
                let marker = if i == snapshot.cursor { '>' } else { ' ' };
                println!("{marker} {i}: {url}");
            }
        }
        "status" => match serde_json::to_string_pretty(&session.snapshot().await) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("Failed to render snapshot: {}", e),
        },
        "help" => println!("{HELP}"),
        "quit" | "exit" => return false,
        other => println!("unknown command {other:?}; try `help`"),
    }

    session.pump_view_events().await;
    let snapshot = session.snapshot().await;
    println!(
        "[{}{}] {}{}",
        if snapshot.can_go_back { '<' } else { ' ' },
        if snapshot.can_go_forward { '>' } else { ' ' },
        snapshot.current_url,
        if snapshot.is_loading { " (loading)" } else { "" }
    );
    true
}

async fn print_outcome(session: &BrowserSession, outcome: DispatchOutcome) {
    match outcome {
        DispatchOutcome::Applied(result) => {
            let header = if result.is_error() {
                "// CORE_ERROR //"
            } else {
                "// CORE_OUTPUT //"
            };
            println!("{header}\n{}", result.text);

            let sources = session
                .analysis()
                .display_sources(&session.current_url().await);
            if !sources.is_empty() {
                println!("// DATA_SOURCES //");
                for source in sources {
                    println!("  - {} <{}>", source.title, source.uri);
                }
            }
        }
        DispatchOutcome::Discarded => println!("(result discarded: page changed)"),
        DispatchOutcome::Rejected => println!("(analysis already running)"),
    }
}

#[cfg(feature = "gemini")]
fn gemini_session(config: BrowserConfig, view: Arc<HeadlessView>) -> anyhow::Result<BrowserSession> {
    Ok(BrowserSession::with_gemini(config, view)?)
}

#[cfg(not(feature = "gemini"))]
fn gemini_session(_config: BrowserConfig, _view: Arc<HeadlessView>) -> anyhow::Result<BrowserSession> {
    anyhow::bail!("built without the `gemini` feature; run with --offline")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::from_args();
    setup_logging(app_config.log_level);

    let mut browser_config = match &app_config.config_path {
        Some(path) => BrowserConfig::from_file(path)?,
        None => BrowserConfig::default(),
    };
    if let Some(url) = app_config.url.clone() {
        browser_config.initial_url = url;
    }

    let view = Arc::new(HeadlessView::new());
    let session = if app_config.offline {
        let analyzer: Arc<dyn ContentAnalyzer> = Arc::new(AiBoundary::new(OfflineBackend));
        BrowserSession::new(browser_config, view.clone(), analyzer)
    } else {
        gemini_session(browser_config, view.clone())?
    };

    info!("Starting Mercurial session {}", session.id());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = unless_interrupted(lines.next_line(), signal::ctrl_c()).await else {
            info!("Received SIGINT, shutting down");
            break;
        };
        let Some(line) = line? else {
            break;
        };

        // A summarize can wait on the network for the full request timeout.
        match unless_interrupted(run_command(&session, &view, line.trim()), signal::ctrl_c()).await
        {
            Some(true) => {}
            Some(false) => break,
            None => {
                info!("Received SIGINT during command, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Runs `work` to completion unless `interrupt` resolves first.
async fn unless_interrupted<T, I>(work: impl Future<Output = T>, interrupt: I) -> Option<T>
where
    I: Future,
{
    tokio::select! {
        output = work => Some(output),
        _ = interrupt => None,
    }
}
