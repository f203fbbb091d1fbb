use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use crossterm::event::{DisableFocusChange, EnableFocusChange};
use crossterm::{execute, terminal};
use serde::Serialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cijene::api::types::{Chain, ProductSearchRequest, StoreSearchRequest};
use cijene::api::CachedApiClient;
use cijene::config::Config;
use cijene::event::{self, ClientEvent, Event, EventHandler};
use cijene::keys;
use cijene::query::{Query, QueryState};

#[derive(Parser, Debug)]
#[command(name = "cijene")]
#[command(about = "Query grocery prices from the Cijene API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cijene/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Search products by name
  Products {
    query: String,
    /// Restrict to a chain (repeatable)
    #[arg(long = "chain")]
    chains: Vec<String>,
    /// Prices as of this date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    page: Option<i64>,
    #[arg(long)]
    per_page: Option<i64>,
  },
  /// Show one product by id or EAN
  Product { id: String },
  /// Compare a product's prices across stores
  Prices { ean: String },
  /// Search stores
  Stores {
    /// Address fragment
    query: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long = "chain")]
    chains: Vec<String>,
  },
  /// Stores around a point
  Nearby {
    #[arg(allow_hyphen_values = true)]
    latitude: f64,
    #[arg(allow_hyphen_values = true)]
    longitude: f64,
    /// Radius in meters
    #[arg(long)]
    radius: Option<f64>,
    #[arg(long = "chain")]
    chains: Vec<String>,
  },
  /// List chains
  Chains {
    /// Filter by name or code
    #[arg(long)]
    search: Option<String>,
    #[arg(long, value_enum)]
    sort: Option<ChainSort>,
    /// Only chains updated within this many days
    #[arg(long)]
    recent: Option<u32>,
  },
  /// Show one chain
  Chain { code: String },
  /// List daily price archives
  Archives {
    #[arg(long)]
    latest: bool,
  },
  /// Download a daily price archive
  Download {
    date: String,
    /// Output file (default: <date>.zip)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Keep the chain list on screen, refreshing it in the background
  Watch {
    /// Refresh interval in seconds
    #[arg(long, default_value_t = 60)]
    interval: u64,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ChainSort {
  Stores,
  Products,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  let config = Config::load(args.config.as_deref())?;
  let client = CachedApiClient::new(&config)?;
  info!(base_url = %config.api.base_url, "starting");

  run(&client, args.command).await?;
  client.cache().shutdown();

  Ok(())
}

async fn run(client: &CachedApiClient, command: Command) -> Result<()> {
  match command {
    Command::Products {
      query,
      chains,
      date,
      page,
      per_page,
    } => {
      let request = ProductSearchRequest {
        query: Some(query),
        chains,
        date,
        page,
        per_page,
        ..ProductSearchRequest::default()
      };
      let result = client.search_products(&request).await?;
      print_json(&*result.data)
    }
    Command::Product { id } => print_json(&*client.product(&id).await?.data),
    Command::Prices { ean } => print_json(&*client.product_prices(&ean).await?.data),
    Command::Stores {
      query,
      city,
      chains,
    } => {
      let request = StoreSearchRequest {
        query,
        city,
        chain_codes: chains,
        ..StoreSearchRequest::default()
      };
      print_json(&*client.search_stores(&request).await?.data)
    }
    Command::Nearby {
      latitude,
      longitude,
      radius,
      chains,
    } => print_json(
      &client
        .nearby_stores(latitude, longitude, radius, &chains)
        .await?,
    ),
    Command::Chains {
      search,
      sort,
      recent,
    } => {
      let chains: Vec<Chain> = match (search, sort, recent) {
        (Some(term), _, _) => client.search_chains(&term).await?,
        (None, _, Some(days)) => client.recently_updated_chains(days).await?,
        (None, Some(ChainSort::Stores), None) => client.chains_by_store_count(true).await?,
        (None, Some(ChainSort::Products), None) => client.chains_by_product_count(true).await?,
        (None, None, None) => client.chains().await?.data.as_ref().clone(),
      };
      print_json(&chains)
    }
    Command::Chain { code } => {
      let chain = client.chain(&code).await?;
      print_json(&chain)
    }
    Command::Archives { latest: true } => print_json(&client.latest_archive().await?),
    Command::Archives { latest: false } => print_json(&*client.archives().await?.data),
    Command::Download { date, output } => {
      let bytes = client.download_archive(&date).await?;
      let path = output.unwrap_or_else(|| PathBuf::from(format!("{}.zip", date)));
      std::fs::write(&path, &bytes)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("{} ({} bytes)", path.display(), bytes.len());
      Ok(())
    }
    Command::Watch { interval } => watch(client, Duration::from_secs(interval.max(1))).await,
  }
}

/// Show the chain list until the user quits, refreshing on interval, focus
/// and reconnect.
async fn watch(client: &CachedApiClient, interval: Duration) -> Result<()> {
  let cache = client.cache();
  let options = cache
    .defaults()
    .queries
    .clone()
    .with_stale_time(interval)
    .with_refetch_interval(Some(interval));

  let api = client.api().clone();
  let mut query = Query::new(cache, keys::chains::lists(), move || {
    let api = api.clone();
    async move { api.chains().await }
  })
  .with_options(options);

  let health_api = client.api().clone();
  cache.listen(event::connectivity_events(
    move || {
      let api = health_api.clone();
      async move { api.health().await.is_ok() }
    },
    Duration::from_secs(15),
  ));

  terminal::enable_raw_mode()?;
  execute!(std::io::stdout(), EnableFocusChange)?;
  let result = watch_loop(cache, &mut query).await;
  execute!(std::io::stdout(), DisableFocusChange)?;
  terminal::disable_raw_mode()?;
  result
}

async fn watch_loop(cache: &cijene::cache::QueryClient, query: &mut Query<Vec<Chain>>) -> Result<()> {
  let mut events = EventHandler::new(Duration::from_millis(250));
  query.fetch();

  while let Some(event) = events.next().await {
    match event {
      Event::Quit => break,
      Event::Client(ClientEvent::FocusGained) => {
        cache.handle_event(ClientEvent::FocusGained);
      }
      Event::Client(_) | Event::Tick => {}
    }

    if query.poll() {
      match query.state() {
        QueryState::Success(chains) => {
          let mut out = std::io::stdout();
          // Raw mode needs explicit carriage returns
          let body = serde_json::to_string_pretty(chains.as_ref())?.replace('\n', "\r\n");
          write!(out, "{}\r\n", body)?;
          out.flush()?;
        }
        QueryState::Error(e) => {
          write!(std::io::stdout(), "error: {}\r\n", e)?;
        }
        QueryState::Idle | QueryState::Loading => {}
      }
    }
  }

  Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Log to a daily file under the data directory (stderr if there is none).
/// Filter with `CIJENE_LOG`, e.g. `CIJENE_LOG=cijene=debug`.
fn init_logging() -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("CIJENE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

  let Some(dir) = dirs::data_dir().map(|d| d.join("cijene").join("logs")) else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "cijene.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
