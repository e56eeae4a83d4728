//! luab: run Lua scripts through the luabridge host bridge.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luabridge_core::logging::render_print_line;
use luabridge_core::{
    BridgeConfig, Engine, HostFunction, HostValue, LogFormat, LogLevel, init_logging,
};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "luab")]
#[command(about = "Run Lua scripts through the luabridge host bridge", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "LUAB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log output format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Extra directory for `require`; may be repeated
    #[arg(short = 'I', long = "search-path", global = true)]
    search_paths: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script to execute
        script: PathBuf,
    },

    /// Evaluate a snippet and print what it returns
    Eval {
        /// Lua source
        source: String,
    },

    /// Call a global function and print its results
    Call {
        /// Script to load before the call
        #[arg(long)]
        script: Option<PathBuf>,

        /// Global function name
        function: String,

        /// Arguments: nil, true, false, numbers, anything else is text
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if cli.config.is_none() {
        config.logging.level = "warn".to_string();
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level.to_string();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("initializing logging")?;

    let mut options = config.engine;
    options.search_paths.extend(cli.search_paths);
    // Scripts run from the command line print to stdout.
    let print_to_stdout = options.print_hook;
    options.print_hook = false;

    let engine = Engine::with_options(&options).context("creating engine")?;
    if print_to_stdout && options.open_standard_libraries {
        engine.register_global("print", stdout_print())?;
    }

    let outcome = run(&engine, cli.command);
    engine.close().context("closing engine")?;
    outcome
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    let results = match command {
        Commands::Run { script } => {
            tracing::debug!(script = %script.display(), "running script");
            engine
                .execute_file(&script)
                .with_context(|| format!("running {}", script.display()))?
        }
        Commands::Eval { source } => engine.evaluate(&source)?,
        Commands::Call {
            script,
            function,
            args,
        } => {
            if let Some(script) = script {
                engine
                    .execute_file(&script)
                    .with_context(|| format!("loading {}", script.display()))?;
            }
            let args: Vec<HostValue> = args.iter().map(|arg| parse_arg(arg)).collect();
            engine
                .call_global(&function, &args)
                .with_context(|| format!("calling {function}"))?
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for value in &results {
        writeln!(out, "{value}")?;
    }
    Ok(())
}

fn parse_arg(arg: &str) -> HostValue {
    match arg {
        "nil" => HostValue::Nil,
        "true" => HostValue::Boolean(true),
        "false" => HostValue::Boolean(false),
        _ => arg
            .parse::<f64>()
            .map_or_else(|_| HostValue::from(arg), HostValue::Number),
    }
}

fn stdout_print() -> HostFunction {
    HostFunction::new("print", |_, args| {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", render_print_line(&args))?;
        Ok(Vec::new())
    })
}
