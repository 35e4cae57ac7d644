use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rentalsync::sync::bookings::ListingBookings;
use rentalsync::sync::listings::ListingsSummary;
use rentalsync::{GateDecision, RentalSync, SyncConfig, SyncResponse};

#[derive(Parser)]
#[command(name = "rentalsync", about = "Property-management listings and reservations sync")]
struct Cli {
    /// Database path (default: ~/.rentalsync/rentalsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Base URL of the remote API (overrides RENTALSYNC_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Page size for listings requests (default: 100)
    #[arg(long)]
    page_size: Option<u32>,

    /// Maximum listings whose bookings are synced in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl rentalsync::SyncProgress for StderrProgress {
    fn on_gate(&self, decision: &GateDecision) {
        if let Some(message) = &decision.message {
            eprintln!("Gate: {message}");
        }
    }

    fn on_listings_page(&self, page: u32, count: usize) {
        eprintln!("  Listings page {page}: {count} items");
    }

    fn on_listings_complete(&self, summary: &ListingsSummary) {
        eprintln!(
            "  Listings: {} created, {} updated, {} archived, {} failed",
            summary.created, summary.updated, summary.archived, summary.failed
        );
    }

    fn on_bookings_start(&self, listings: usize, concurrency: usize) {
        eprintln!("Syncing bookings for {listings} listings ({concurrency} at a time)...");
    }

    fn on_listing_bookings(&self, listing_id: &str, result: &Result<ListingBookings, String>) {
        match result {
            Ok(counts) => eprintln!(
                "  {listing_id}: {} synced, {} cancelled",
                counts.synced, counts.cancelled
            ),
            Err(message) => eprintln!("  {listing_id}: FAILED ({message})"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one gated sync and print the JSON result
    Sync,
    /// Show mirror status
    Status,
    /// Show integration health for the configured provider
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent sync runs
    Runs {
        /// Maximum runs to show
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List mirrored listings
    Listings {
        /// Include archived listings
        #[arg(long)]
        archived: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List mirrored bookings
    Bookings {
        /// Only bookings of this listing
        #[arg(long)]
        listing: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List housekeeping tasks
    Tasks {
        /// Include cancelled tasks
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = SyncConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(url) = &cli.api_url {
        config = config.with_base_url(url);
    }
    if let Some(page_size) = cli.page_size {
        anyhow::ensure!(page_size > 0, "--page-size must be greater than zero");
        config.page_size = page_size;
    }
    if let Some(concurrency) = cli.concurrency {
        config.max_concurrency = concurrency.max(1);
    }

    let db = match &cli.db {
        Some(path) => rentalsync::Database::open_at(path).await?,
        None => rentalsync::Database::open().await?,
    };
    let app = RentalSync::new(db, config);

    match cli.command {
        Commands::Sync => {
            let response = app.sync(&StderrProgress).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(exit_code(&response));
        }
        Commands::Status => print_status(&app).await?,
        Commands::Health { json } => print_health(&app, json).await?,
        Commands::Runs { limit, json } => {
            let runs = app.runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No sync runs recorded.");
            } else {
                for run in runs {
                    println!(
                        "#{:<5} {} {:<11} retry={} items={:<5} {}",
                        run.id,
                        rentalsync::date_util::to_db(&run.start_time),
                        run.status.as_str(),
                        run.retry_count,
                        run.items_count,
                        run.message.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Listings { archived, json } => {
            let listings = app.listings(archived).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                for l in &listings {
                    println!(
                        "{:<12} {:<9} {}",
                        l.id,
                        l.sync_status,
                        l.title.as_deref().unwrap_or("(untitled)")
                    );
                }
                println!("{} listings", listings.len());
            }
        }
        Commands::Bookings { listing, json } => {
            let bookings = app.bookings(listing.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&bookings)?);
            } else {
                for b in &bookings {
                    println!(
                        "{:<14} listing={:<10} {} -> {} {:<10} {}",
                        b.id,
                        b.listing_id,
                        b.check_in.as_deref().unwrap_or("?"),
                        b.check_out.as_deref().unwrap_or("?"),
                        b.status,
                        b.guest_name.as_deref().unwrap_or("")
                    );
                }
                println!("{} bookings", bookings.len());
            }
        }
        Commands::Tasks { all, json } => {
            let tasks = app.tasks(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No housekeeping tasks.");
            } else {
                for t in tasks {
                    println!(
                        "{} {:<18} listing={:<10} booking={:<14} {}",
                        t.due_date.as_deref().unwrap_or("----------"),
                        t.task_type,
                        t.listing_id,
                        t.booking_id,
                        t.status
                    );
                }
            }
        }
        Commands::Config { action } => handle_config(&app, action).await?,
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(response: &SyncResponse) -> ExitCode {
    match response.status() {
        200 => ExitCode::SUCCESS,
        // Blocked or throttled: a later run can succeed
        429 => ExitCode::from(75),
        _ => ExitCode::FAILURE,
    }
}

async fn print_status(app: &RentalSync) -> anyhow::Result<()> {
    let status = app.status().await?;
    println!("Mirror Status");
    println!("  Listings:  {} active, {} archived", status.active_listings, status.archived_listings);
    println!("  Bookings:  {}", status.bookings);
    println!("  Tasks:     {} pending", status.pending_tasks);
    match &status.last_run {
        Some(run) => println!(
            "  Last run:  {} ({})",
            rentalsync::date_util::to_db(&run.start_time),
            run.status.as_str()
        ),
        None => println!("  Last run:  never"),
    }
    println!(
        "  Last sync: {}",
        status
            .last_completed
            .map(|run| rentalsync::date_util::to_db(&run.start_time))
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

async fn print_health(app: &RentalSync, json: bool) -> anyhow::Result<()> {
    let health = app.health().await?;
    let snapshot = app.latest_rate_limit().await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "health": health,
                "rateLimit": snapshot,
            }))?
        );
        return Ok(());
    }

    let Some(health) = health else {
        println!("No sync has been recorded yet.");
        return Ok(());
    };
    println!("Integration: {}", health.provider);
    println!("  Status:        {}", health.status);
    println!("  Last synced:   {}", health.last_synced.as_deref().unwrap_or("never"));
    if let Some(error) = &health.last_error {
        println!("  Last error:    {error}");
    }
    println!("  Requests:      {} (last run)", health.request_count);
    if let Some(remaining) = health.remaining_requests {
        println!("  Remaining:     {remaining}");
    }
    if let Some(reset) = &health.rate_limit_reset {
        println!("  Quota reset:   {reset}");
    }
    println!("  Rate limited:  {}", if health.is_rate_limited { "yes" } else { "no" });
    Ok(())
}

async fn handle_config(app: &RentalSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {}", display_value(&key, &v)),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {}", display_value(&k, &v));
                }
            }
        }
    }
    Ok(())
}

fn display_value(key: &str, value: &str) -> String {
    if key == rentalsync::CLIENT_SECRET_KEY {
        "********".to_string()
    } else {
        value.to_string()
    }
}
