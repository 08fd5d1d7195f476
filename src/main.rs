use anyhow::Result;
use clap::{Parser, Subcommand};
use owa_harvest::{browser::BrowserHandle, config, inspect, provider, server};

#[derive(Parser)]
#[command(name = "owa-harvest")]
#[command(about = "Webmail address-harvesting service driven over a headless browser")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// HTTP port (default: 8700)
        #[arg(long)]
        port: Option<u16>,
        /// Run the browser with a visible window
        #[arg(long)]
        headful: bool,
        /// Browser executable path
        #[arg(long)]
        chrome: Option<String>,
    },
    /// Launch a browser, open the portal and report the detected provider
    Check,
    /// Dump which selector candidates match the current portal markup
    Inspect,
    /// Configure settings
    Config {
        /// Set the HTTP port
        #[arg(long)]
        port: Option<u16>,
        /// Set the portal URL
        #[arg(long)]
        portal: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("owa_harvest=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config()?;

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        headful: false,
        chrome: None,
    }) {
        Commands::Serve {
            port,
            headful,
            chrome,
        } => {
            if let Some(p) = port {
                cfg.port = Some(p);
            }
            if headful {
                cfg.headless = Some(false);
            }
            if let Some(path) = chrome {
                cfg.chrome_path = Some(path);
            }
            server::serve(cfg).await?;
        }
        Commands::Check => {
            let handle = BrowserHandle::launch(&cfg).await?;
            let reachable = handle.navigate(cfg.portal_url()).await;
            if !reachable {
                handle.close().await;
                anyhow::bail!("portal did not load: {}", cfg.portal_url());
            }
            let kind = provider::detect_on_page(&handle).await;
            let title = handle
                .evaluate_string("document.title")
                .await
                .unwrap_or_default();
            println!("Portal loaded: {}", cfg.portal_url());
            println!("  title:    {}", title);
            println!("  provider: {}", kind);
            handle.close().await;
        }
        Commands::Inspect => {
            let handle = BrowserHandle::launch(&cfg).await?;
            handle.navigate(cfg.portal_url()).await;
            let report = inspect::inspect_page(&handle).await?;
            println!("{report}");
            handle.close().await;
        }
        Commands::Config { port, portal } => {
            let mut changed = false;
            if let Some(p) = port {
                cfg.port = Some(p);
                changed = true;
            }
            if let Some(url) = portal {
                cfg.portal_url = Some(url);
                changed = true;
            }
            if changed {
                config::save_config(&cfg)?;
                println!("Settings saved.");
            } else {
                println!("Current settings:");
                println!("  port:     {}", cfg.port());
                println!("  portal:   {}", cfg.portal_url());
                println!("  headless: {}", cfg.headless());
            }
        }
    }

    Ok(())
}
