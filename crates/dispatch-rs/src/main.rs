//! Run one query through the dispatch pipeline against a demo capability
//! set and print the outcome as JSON.
//!
//! # Examples
//!
//! ```sh
//! # Basic request
//! dispatch "where is my refund for order A-1042?"
//!
//! # Lower the selection threshold and show info-level logs
//! dispatch "track my package" --threshold 0.2 -v
//!
//! # Simulate a failing capability to see the fallback
//! dispatch "track my package" --fail shipping_tracker
//!
//! # Load configuration from a file and print the effective config
//! dispatch --config dispatch.json --print-config
//! ```

use std::error::Error;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dispatch_rs::context::{ContextEntry, ContextKind, StaticContextProvider};
use dispatch_rs::events::LoggingHandler;
use dispatch_rs::tools::{FnTool, ToolDescriptor, ToolInput};
use dispatch_rs::{DispatchConfig, Dispatcher};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

/// Route a query to the demo capabilities and print the outcome.
#[derive(Parser)]
#[command(name = "dispatch")]
struct Cli {
    /// The user query to dispatch
    #[arg(required_unless_present = "print_config")]
    query: Option<String>,

    /// User the context is retrieved for
    #[arg(long, default_value = "demo-user")]
    user: String,

    /// Session identifier echoed in the outcome
    #[arg(long, default_value = "demo-session")]
    session: String,

    // ── Configuration ──────────────────────────────────────────
    /// JSON config file (missing fields keep their defaults)
    #[arg(long)]
    config: Option<String>,

    /// Minimum recommendation score for a tool to run (0.0 – 1.0)
    #[arg(long)]
    threshold: Option<f64>,

    /// Maximum tools executing at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    // ── Demo behavior ──────────────────────────────────────────
    /// Make the named demo tool fail (repeatable)
    #[arg(long = "fail")]
    failing: Vec<String>,

    /// Print compact JSON instead of pretty-printed
    #[arg(long)]
    compact: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_config(cli: &Cli) -> Result<DispatchConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => DispatchConfig::from_json_file(path)?,
        None => DispatchConfig::default(),
    };
    if let Some(threshold) = cli.threshold {
        config = config.with_threshold(threshold);
    }
    if let Some(max) = cli.max_concurrent {
        config = config.with_max_concurrent_operations(max);
    }
    config.validate()?;
    Ok(config)
}

fn demo_tool(descriptor: ToolDescriptor, failing: bool, respond: fn(&ToolInput) -> Value) -> FnTool {
    FnTool::new(descriptor, move |input: ToolInput| {
        let out = if failing {
            Err("simulated failure".to_string())
        } else {
            Ok(respond(&input))
        };
        async move { out }
    })
}

fn demo_tools(failing: &[String]) -> Vec<FnTool> {
    let fails = |name: &str| failing.iter().any(|f| f == name);
    vec![
        demo_tool(
            ToolDescriptor::new("order_lookup")
                .with_keywords(["order", "lookup", "purchase", "status"])
                .with_history(0.95, Duration::from_millis(40)),
            fails("order_lookup"),
            |_| json!({ "order_id": "A-1042", "state": "delivered" }),
        ),
        demo_tool(
            ToolDescriptor::new("refund_status")
                .with_keywords(["refund", "return", "money"])
                .depends_on("order_lookup")
                .with_history(0.9, Duration::from_millis(80)),
            fails("refund_status"),
            |input| {
                let order = input
                    .upstream
                    .get("order_lookup")
                    .and_then(|o| o.get("order_id"))
                    .cloned()
                    .unwrap_or(Value::Null);
                json!({ "order_id": order, "refund": "issued", "eta_days": 3 })
            },
        ),
        demo_tool(
            ToolDescriptor::new("shipping_tracker")
                .with_keywords(["shipping", "package", "track", "delivery"])
                .with_fallback("shipping_estimate")
                .with_timeout(Duration::from_secs(2)),
            fails("shipping_tracker"),
            |_| json!({ "carrier": "UPS", "location": "Memphis, TN" }),
        ),
        demo_tool(
            ToolDescriptor::new("shipping_estimate").with_keywords(["shipping", "estimate"]),
            fails("shipping_estimate"),
            |_| json!({ "estimate": "2-4 business days" }),
        ),
        demo_tool(
            ToolDescriptor::new("faq_search")
                .with_keywords(["help", "question", "policy", "faq"])
                .with_history(0.7, Duration::from_millis(20)),
            fails("faq_search"),
            |input| json!({ "matches": [], "query": input.query }),
        ),
    ]
}

fn demo_provider(user: &str) -> StaticContextProvider {
    StaticContextProvider::new("history")
        .with_entry(
            user,
            ContextEntry::new(
                "Customer asked to return order A-1042 last week; refund pending",
                "history",
                ContextKind::Message,
            ),
        )
        .with_entry(
            user,
            ContextEntry::new(
                "Customer prefers email updates about shipping",
                "history",
                ContextKind::Preference,
            ),
        )
        .with_recent(ContextEntry::new(
            "Carrier delays reported for package delivery in the midwest",
            "status",
            ContextKind::Document,
        ))
}

async fn run(cli: &Cli) -> Result<String, Box<dyn Error>> {
    let config = load_config(cli)?;
    if cli.print_config {
        return Ok(serde_json::to_string_pretty(&config)?);
    }
    let query = cli.query.as_deref().unwrap_or_default();

    let mut builder = Dispatcher::builder(config)
        .provider(Arc::new(demo_provider(&cli.user)))
        .event_handler(Arc::new(LoggingHandler));
    for tool in demo_tools(&cli.failing) {
        builder = builder.tool(tool);
    }
    let dispatcher = builder.build()?;

    let outcome = dispatcher.process(query, &cli.user, &cli.session).await?;
    let rendered = if cli.compact {
        serde_json::to_string(&outcome)?
    } else {
        serde_json::to_string_pretty(&outcome)?
    };
    Ok(rendered)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
