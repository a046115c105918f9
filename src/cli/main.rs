use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use toolrun::sandbox::harness::BRIDGE_ERROR_PREFIX;
use toolrun::sandbox::{SandboxRequest, SandboxRunner};
use toolrun::shared::raw_output::{record_sandbox_run, sandbox_key};
use toolrun::shared::{logging, MemoryRawOutputStore, ToolrunConfig};
use toolrun::tools::client::HttpToolClient;
use toolrun::tools::summary::summarize;
use toolrun::tools::truncate::truncate_map;
use toolrun::tools::{normalize, ToolInvoker};

#[derive(Parser)]
#[command(name = "toolrun")]
#[command(about = "Tool response normalization and sandboxed code execution")]
struct Args {
    /// JSON config file (defaults to ~/.toolrun/toolrun.json when present)
    #[arg(long, env = "TOOLRUN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for rolling log files; console logs always go to stderr
    #[arg(long, env = "TOOLRUN_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a code body (file or stdin) in the sandbox and print the result
    Run {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "run")]
        label: String,
        #[arg(long, env = "TOOLRUN_USER_ID")]
        user_id: Option<String>,
        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the raw-output record with a payload summary
        #[arg(long)]
        summarize: bool,
    },
    /// Invoke one tool with the payload read from stdin (sandbox bridge endpoint)
    Call {
        provider: String,
        tool: String,
        #[arg(long, env = "TOOLRUN_USER_ID")]
        user_id: Option<String>,
        /// Sandbox run that issued the call, attached to tool telemetry
        #[arg(long, env = "TOOLRUN_REQUEST_ID")]
        request_id: Option<String>,
    },
    /// Normalize a raw tool response read from stdin
    Normalize {
        #[arg(long)]
        truncate: bool,
    },
    /// Summarize a payload read from stdin
    Summarize {
        #[arg(long)]
        label: String,
        #[arg(long)]
        persist: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _ = logging::init_service_logging(args.log_dir.as_deref(), "toolrun");
    let config = ToolrunConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Run {
            file,
            label,
            user_id,
            timeout,
            summarize,
        } => run_sandbox(&config, file, label, user_id, timeout, summarize).await,
        Commands::Call {
            provider,
            tool,
            user_id,
            request_id,
        } => {
            if let Err(e) = call_tool(&config, &provider, &tool, user_id, request_id).await {
                eprintln!("{}{}", BRIDGE_ERROR_PREFIX, e);
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Normalize { truncate } => normalize_stdin(&config, truncate),
        Commands::Summarize { label, persist } => {
            let payload = read_stdin_json()?.unwrap_or(Value::Null);
            let summary = summarize(&label, &payload, &config.summary_options(persist));
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
    }
}

async fn run_sandbox(
    config: &ToolrunConfig,
    file: Option<PathBuf>,
    label: String,
    user_id: Option<String>,
    timeout: Option<u64>,
    summarize_result: bool,
) -> Result<()> {
    let code = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read code from {}", path.display()))?,
        None => read_stdin()?,
    };

    let mut sandbox_config = config.sandbox_config();
    if sandbox_config.bridge_executable.is_none() {
        sandbox_config.bridge_executable = std::env::current_exe().ok();
    }

    let mut request = SandboxRequest::new(label.clone(), code.clone());
    if let Some(user_id) = user_id {
        request = request.with_user_id(user_id);
    }
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let runner = SandboxRunner::new(sandbox_config);
    let result = runner.run(&request).await?;

    if summarize_result {
        let store = MemoryRawOutputStore::new();
        record_sandbox_run(
            &store,
            &label,
            &code,
            config.sandbox.log_preview_chars,
            &result,
            &config.summary_options(false),
        );
        let record = store
            .get(&sandbox_key(&label))
            .ok_or_else(|| anyhow!("sandbox record for {} was not stored", label))?;
        println!("{}", serde_json::to_string(&record)?);
    } else {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}

async fn call_tool(
    config: &ToolrunConfig,
    provider: &str,
    tool: &str,
    user_id: Option<String>,
    request_id: Option<String>,
) -> Result<()> {
    let payload: Map<String, Value> = match read_stdin_json()? {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(anyhow!("tool payload must be a JSON object")),
    };

    let endpoint = config
        .endpoint
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("no tool endpoint configured (set TOOLRUN_TOOL_ENDPOINT)"))?;
    let client = HttpToolClient::new(
        endpoint,
        config.endpoint.api_key.clone(),
        user_id.clone(),
        Duration::from_secs(config.endpoint.timeout_secs),
    )?;

    info!(provider = provider, tool = tool, "Bridge call received");
    let invoker = ToolInvoker::new(Arc::new(client))
        .with_retry_policy(config.retry_policy())
        .with_sensitive_keys(config.sensitive_keys())
        .with_user_id(user_id)
        .with_request_id(request_id);

    let response = invoker.try_invoke(provider, tool, &payload).await?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn normalize_stdin(config: &ToolrunConfig, truncate: bool) -> Result<()> {
    let raw = read_stdin_json()?;
    let response = normalize(raw.as_ref());

    let mut output = response.to_value();
    if truncate {
        if let Some(fields) = output.as_object_mut() {
            fields.insert(
                "data".to_string(),
                truncate_map(&response.data, &config.truncation),
            );
            fields.remove("raw");
        }
    }
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    Ok(input)
}

fn read_stdin_json() -> Result<Option<Value>> {
    let input = read_stdin()?;
    if input.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&input).context("stdin is not valid JSON")?;
    Ok(Some(value))
}
