//! Siteplan CLI - run site action plans from the command line
//!
//! Loads a site catalog, detects which site handles an address and runs
//! individual actions against it, printing broadcast results as JSON.

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use siteplan::runtime::{
    AuthPageResult, ContextHandle, PageHost, RuntimeConfig, SiteCatalog, SiteEvent,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "siteplan")]
#[command(about = "Run declarative video-site action plans", long_about = None)]
struct Cli {
    /// Site catalog (JSON)
    #[arg(short, long, default_value = "sites.json")]
    catalog: PathBuf,

    /// Log every step result
    #[arg(long)]
    debug: bool,

    /// Entries per listing page
    #[arg(long, default_value = "20")]
    page_size: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the sites in the catalog
    Sites,

    /// Find the site handling an address
    Detect {
        /// Channel or video address
        address: String,
    },

    /// Run one action of a site
    Run {
        /// Site name in the catalog
        site: String,

        /// Channel or video address
        address: String,

        /// Action name
        action: String,

        /// Parameters as key=value (values parsed as JSON when possible)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Drive the plan inline instead of on the scheduler
        #[arg(long)]
        wait: bool,
    },
}

/// Shows pages by printing the URL and reading the final page text from stdin.
struct StdinPageHost;

impl PageHost for StdinPageHost {
    fn show_page(&self, url: &str, context: ContextHandle) {
        println!("open {url} and paste the resulting page text:");
        let url = url.to_string();
        std::thread::spawn(move || {
            let mut line = String::new();
            let success = std::io::stdin().lock().read_line(&mut line).is_ok();
            let reply = AuthPageResult {
                url,
                success,
                text: line.trim_end().to_string(),
            };
            context.set_value(reply.into_value());
        });
    }
}

fn parse_params(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("parameter `{pair}` is not key=value");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn print_event(event: &SiteEvent) {
    match event {
        SiteEvent::ThumbnailLoaded { url, tag, bytes } => {
            println!("thumbnail {tag} {url} ({} bytes)", bytes.len())
        }
        SiteEvent::ActionFailed(report) => eprintln!("{report}"),
        other => println!("{other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let catalog = SiteCatalog::load_file(&cli.catalog)?;
    let runtime = RuntimeConfig {
        debug: cli.debug,
        page_size: cli.page_size,
        ..Default::default()
    };
    let services = runtime.services().with_pages(Arc::new(StdinPageHost));

    match cli.command {
        Commands::Sites => {
            for (name, config) in catalog.iter() {
                let actions: Vec<_> = config.plan_names().collect();
                println!("{name}  {}  [{}]", config.title(), actions.join(", "));
            }
        }

        Commands::Detect { address } => {
            match catalog.detect(&address, &services, &runtime).await? {
                Some(site) => println!("{} (channel: {})", site.name(), site.channel()),
                None => println!("no site handles {address}"),
            }
        }

        Commands::Run {
            site,
            address,
            action,
            params,
            wait,
        } => {
            let site = catalog
                .open(&site, &address, &services, &runtime)
                .await
                .with_context(|| format!("opening {address} with `{site}`"))?;
            let params = parse_params(&params)?;

            if wait {
                let value = site.call_wait(&action, params).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            let mut events = site.subscribe();
            let ctx = site.call_async(&action, params)?;
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    print_event(&event);
                }
            });
            let result = ctx.outcome().await;
            // let the printer drain what was broadcast before the outcome
            tokio::task::yield_now().await;
            printer.abort();
            let value = result?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}
