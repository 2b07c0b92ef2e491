use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailroom", version, about = "Gmail ingestion and local inbox cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database path
    #[arg(long, global = true, env = "MAILROOM_DB")]
    db: Option<PathBuf>,

    /// User to act for, by local id or email address
    #[arg(long, global = true)]
    user: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage registered users
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Fetch one page of the remote inbox and cache it
    Fetch(FetchArgs),
    /// Search the remote mailbox with Gmail operators and cache the matches
    Search(SearchArgs),
    /// Show one cached email by local ID
    Show { id: i64 },
    /// Ingest the next page and remember where the following one starts
    Sync(SyncArgs),
    /// List cached emails without contacting Gmail
    Cached(CachedArgs),
    /// Show cached email counts
    Stats,
    /// Run the JSON-RPC tool server over stdio
    Serve(UpsertArgs),
}

#[derive(Debug, Args)]
struct UpsertArgs {
    /// Rewrite labels and flags of messages that are already cached
    #[arg(long, default_value_t = false)]
    refresh_labels: bool,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long)]
    max_results: Option<u32>,
    #[arg(long)]
    page_token: Option<String>,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Optional Gmail search operators
    #[arg(long)]
    query: Option<String>,
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    upsert: UpsertArgs,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    upsert: UpsertArgs,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    max_results: Option<u32>,
    /// Continue from the stored cursor instead of the newest page
    #[arg(long, default_value_t = false)]
    resume: bool,
    #[command(flatten)]
    upsert: UpsertArgs,
}

#[derive(Debug, Args)]
struct CachedArgs {
    /// Substring matched against subject, sender and body
    #[arg(long)]
    query: Option<String>,
    #[arg(long, default_value_t = false)]
    unread: bool,
    #[arg(long, default_value_t = false)]
    starred: bool,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Subcommand)]
enum UserCommands {
    /// Register a user or refresh their profile and tokens
    Add(AddUserArgs),
    /// List registered users
    List,
    /// Show one user
    Show { user: String },
    /// Replace a user's preference bag with a JSON object
    Prefs { user: String, preferences: String },
}

#[derive(Debug, Args)]
struct AddUserArgs {
    #[arg(long)]
    google_id: String,
    #[arg(long)]
    email: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long)]
    picture: Option<String>,
    #[arg(long, env = "MAILROOM_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, env = "MAILROOM_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,
    /// Access token expiry as RFC 3339
    #[arg(long)]
    token_expiry: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::Path;

    use anyhow::{anyhow, Context, Result};
    use chrono::{DateTime, Utc};

    use mailroom::config::Config;
    use mailroom::connectors::{GmailApiClient, GoogleTokenClient};
    use mailroom::db::models::{NewUser, PageToken, User};
    use mailroom::db::{Database, EmailListFilters};
    use mailroom::ingest::{FetchOptions, InboxService, SyncOptions, UpsertMode};
    use mailroom::mcp::{self, ToolContext};
    use mailroom::output::{self, OutputFormat};

    use super::{AddUserArgs, CachedArgs, Cli, Commands, PageArgs, UpsertArgs, UserCommands};

    type GmailService = InboxService<GmailApiClient, GoogleTokenClient>;

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = Config::from_env().context("load mailroom configuration")?;
        let db_path = match cli.db.clone().or_else(|| config.db_path.clone()) {
            Some(path) => path,
            None => Database::default_db_path().context("resolve default mailroom database path")?,
        };
        let db = open_database(&db_path, &config)?;
        let format = OutputFormat::from_json_flag(cli.json);
        let selector = cli.user.as_deref();

        match cli.command {
            Commands::Users { command } => handle_users(&db, command, format),
            Commands::Fetch(args) => {
                let user = resolve_user(&db, selector)?;
                let service = build_service(&config, &args.upsert)?;
                let options = FetchOptions {
                    query: args.query,
                    ..page_options(args.page)
                };
                let page = service.fetch(&db, user.id, &options).await?;
                println!("{}", output::format_page(format, &page)?);
                Ok(())
            }
            Commands::Search(args) => {
                let user = resolve_user(&db, selector)?;
                let service = build_service(&config, &args.upsert)?;
                let page = service
                    .search(&db, user.id, &args.query, &page_options(args.page))
                    .await?;
                println!("{}", output::format_page(format, &page)?);
                Ok(())
            }
            Commands::Show { id } => {
                let user = resolve_user(&db, selector)?;
                let email = db
                    .get_email(user.id, id)?
                    .ok_or_else(|| anyhow!("email not found for id {id}"))?;
                println!("{}", output::format_email(format, &email)?);
                Ok(())
            }
            Commands::Sync(args) => {
                let user = resolve_user(&db, selector)?;
                let service = build_service(&config, &args.upsert)?;
                let options = SyncOptions {
                    max_results: args.max_results,
                    query: args.query,
                    resume: args.resume,
                };
                let report = service
                    .sync(&db, user.id, &options)
                    .await
                    .with_context(|| format!("sync mailbox for {}", user.email))?;
                println!("{}", output::format_sync_report(format, &report)?);
                Ok(())
            }
            Commands::Cached(args) => handle_cached(&db, selector, args, format),
            Commands::Stats => {
                let user = resolve_user(&db, selector)?;
                let stats = db.get_stats(user.id)?;
                println!("{}", output::format_stats(format, &stats)?);
                Ok(())
            }
            Commands::Serve(args) => {
                let service = build_service(&config, &args)?;
                let ctx = ToolContext { db, service };
                mcp::run_stdio_server(&ctx).await
            }
        }
    }

    fn open_database(path: &Path, config: &Config) -> Result<Database> {
        let db = Database::open(path)
            .with_context(|| format!("open mailroom database at {}", path.display()))?;
        Ok(match config.token_sealer.clone() {
            Some(sealer) => db.with_token_sealer(sealer),
            None => db,
        })
    }

    fn build_service(config: &Config, upsert: &UpsertArgs) -> Result<GmailService> {
        let api = GmailApiClient::new(config.gmail_api_base.clone(), config.http_timeout)
            .context("build Gmail API client")?;
        let tokens = GoogleTokenClient::new(
            config.token_url.clone(),
            config.oauth_client.clone(),
            config.http_timeout,
        )
        .context("build OAuth token client")?;

        let mode = if upsert.refresh_labels {
            UpsertMode::RefreshLabels
        } else {
            UpsertMode::InsertIfAbsent
        };
        Ok(InboxService::new(api, tokens).with_upsert_mode(mode))
    }

    fn page_options(page: PageArgs) -> FetchOptions {
        FetchOptions {
            max_results: page.max_results,
            page_token: page
                .page_token
                .filter(|token| !token.trim().is_empty())
                .map(PageToken::new),
            query: None,
        }
    }

    fn handle_users(db: &Database, command: UserCommands, format: OutputFormat) -> Result<()> {
        match command {
            UserCommands::Add(args) => {
                let user = db.upsert_user(&new_user(args)?)?;
                println!("{}", output::format_user(format, &user)?);
            }
            UserCommands::List => {
                let users = db.list_users()?;
                println!("{}", output::format_users(format, &users)?);
            }
            UserCommands::Show { user } => {
                let user = resolve_user(db, Some(&user))?;
                println!("{}", output::format_user(format, &user)?);
            }
            UserCommands::Prefs { user, preferences } => {
                let user = resolve_user(db, Some(&user))?;
                let preferences: serde_json::Value = serde_json::from_str(&preferences)
                    .with_context(|| format!("parse preferences JSON '{preferences}'"))?;
                if !preferences.is_object() {
                    return Err(anyhow!("preferences must be a JSON object"));
                }
                db.update_preferences(user.id, &preferences)?;
                let updated = db
                    .get_user(user.id)?
                    .ok_or_else(|| anyhow!("user not found: {}", user.id))?;
                println!("{}", output::format_user(format, &updated)?);
            }
        }
        Ok(())
    }

    fn handle_cached(
        db: &Database,
        selector: Option<&str>,
        args: CachedArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let user = resolve_user(db, selector)?;
        let emails = db.list_emails(EmailListFilters {
            user_id: user.id,
            query: args.query,
            unread_only: args.unread,
            starred_only: args.starred,
            limit: args.limit,
            offset: args.offset,
        })?;
        println!("{}", output::format_emails(format, &emails)?);
        Ok(())
    }

    fn new_user(args: AddUserArgs) -> Result<NewUser> {
        let token_expiry = args
            .token_expiry
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw.trim())
                    .map(|value| value.with_timezone(&Utc))
                    .with_context(|| format!("invalid --token-expiry '{raw}', expected RFC 3339"))
            })
            .transpose()?;

        Ok(NewUser {
            google_id: args.google_id,
            email: args.email,
            name: args.name,
            picture: args.picture,
            access_token: args.access_token,
            refresh_token: args.refresh_token,
            token_expiry,
        })
    }

    fn resolve_user(db: &Database, selector: Option<&str>) -> Result<User> {
        if let Some(selector) = selector.map(str::trim).filter(|s| !s.is_empty()) {
            let found = match selector.parse::<i64>() {
                Ok(id) => db.get_user(id)?,
                Err(_) => db.get_user_by_email(selector)?,
            };
            return found.ok_or_else(|| anyhow!("user not found: {selector}"));
        }

        let mut users = db.list_users()?;
        match users.len() {
            0 => Err(anyhow!(
                "no users registered; use 'mailroom users add' first"
            )),
            1 => Ok(users.remove(0)),
            _ => Err(anyhow!(
                "multiple users registered; pass --user <id|email> to choose one"
            )),
        }
    }
}
