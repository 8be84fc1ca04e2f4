use std::io::{self, Write};
use std::process::{Command as Process, Stdio};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use larder::admin::DetailedSettingsApi;
use larder::app_info::AppInfoClient;
use larder::auth::{AuthSession, Credentials};
use larder::cookbooks::{CookbookStore, PublicCookbookStore, SharedCookbooks};
use larder::routes::{DEFAULT_IMAGE_KEY, ImageSize, StaticRoutes};
use larder::shopping::copy::render_copy_text;
use larder::shopping::{Clipboard, CopyFormat, LabelBucket, ShoppingListPage};
use larder::types::ReadCookbook;
use larder::{ApiClient, ApiError, ClientConfig, ToastLevel, UiEvent};
use serde_json::Value;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[cfg(test)]
#[path = "main_test.rs"]
mod main_test;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("shopping list {0} not found")]
    ListNotFound(String),
    #[error("clipboard unavailable: {0}")]
    Clipboard(io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "larder", about = "Command-line client for a Mealie recipe server")]
struct Cli {
    #[arg(long, env = "LARDER_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "LARDER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange a username and password for an access token.
    Login {
        #[arg(long, env = "LARDER_USERNAME")]
        username: String,
        #[arg(long, env = "LARDER_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value_t = false)]
        remember_me: bool,
    },
    Whoami,
    /// Server version and feature flags.
    About,
    List(ListCommand),
    Cookbooks {
        /// Show a group's public cookbooks instead of the household's.
        #[arg(long)]
        group: Option<String>,
    },
    Settings(SettingsCommand),
    /// Print the URL of a recipe image.
    Image {
        recipe_id: String,
        #[arg(long, value_enum, default_value_t = SizeArg::Original)]
        size: SizeArg,
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ListCommand {
    #[command(subcommand)]
    command: ListSubcommand,
}

#[derive(Subcommand, Debug)]
enum ListSubcommand {
    Show {
        list_id: String,
        #[arg(long, default_value = "plain")]
        format: CopyFormat,
        /// Also copy the output to the system clipboard.
        #[arg(long, default_value_t = false)]
        copy: bool,
    },
    /// Print the list every time it changes until interrupted.
    Watch {
        list_id: String,
    },
    AddRecipe {
        list_id: String,
        recipe_id: String,
    },
    RemoveRecipe {
        list_id: String,
        recipe_id: String,
    },
}

#[derive(Args, Debug)]
struct SettingsCommand {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Subcommand, Debug)]
enum SettingsSubcommand {
    Get,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SizeArg {
    Original,
    Min,
    Tiny,
}

impl From<SizeArg> for ImageSize {
    fn from(size: SizeArg) -> Self {
        match size {
            SizeArg::Original => Self::Original,
            SizeArg::Min => Self::Small,
            SizeArg::Tiny => Self::Tiny,
        }
    }
}

struct CliContext {
    config: ClientConfig,
    api: ApiClient,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = ClientConfig::new(base_url)?.base_url;
    }
    let api = ApiClient::from_config(&config)?;
    api.token().set(cli.token.clone());
    spawn_toast_printer(&api);

    let ctx = CliContext { config, api };
    match cli.command {
        Command::Login { username, password, remember_me } => run_login(&ctx, username, password, remember_me).await,
        Command::Whoami => run_whoami(&ctx).await,
        Command::About => run_about(&ctx).await,
        Command::List(list) => run_list(&ctx, list).await,
        Command::Cookbooks { group } => run_cookbooks(&ctx, group).await,
        Command::Settings(settings) => run_settings(&ctx, settings).await,
        Command::Image { recipe_id, size, version } => {
            let routes = StaticRoutes::from_config(&ctx.config);
            let path = routes.recipe_image_sized(size.into(), &recipe_id, version.as_deref(), DEFAULT_IMAGE_KEY);
            println!("{}{path}", ctx.config.base_url);
            Ok(())
        }
    }
}

/// Server messages surface as toasts; print them to stderr.
fn spawn_toast_printer(api: &ApiClient) {
    let mut rx = api.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                UiEvent::Toast(toast) => match toast.level {
                    ToastLevel::Info => eprintln!("{}", toast.message),
                    ToastLevel::Error => eprintln!("error: {}", toast.message),
                },
                UiEvent::Navigate(path) => debug!(%path, "navigation requested"),
            }
        }
    });
}

fn require_token(ctx: &CliContext) -> Result<(), CliError> {
    if ctx.api.token().is_set() { Ok(()) } else { Err(ApiError::NotAuthenticated.into()) }
}

async fn run_login(ctx: &CliContext, username: String, password: String, remember_me: bool) -> Result<(), CliError> {
    let session = AuthSession::new(ctx.api.clone(), &ctx.config);
    let mut credentials = Credentials::new(username, password);
    credentials.remember_me = remember_me;
    session.sign_in(credentials).await?;

    if let Some(user) = session.user() {
        eprintln!("signed in as {}", user.username.as_deref().unwrap_or(&user.email));
    }
    if let Some(token) = ctx.api.token().get() {
        println!("{token}");
    }
    Ok(())
}

async fn run_whoami(ctx: &CliContext) -> Result<(), CliError> {
    require_token(ctx)?;
    let session = AuthSession::new(ctx.api.clone(), &ctx.config);
    session.get_session().await?;
    let Some(user) = session.user() else {
        return Err(ApiError::NotAuthenticated.into());
    };
    print_json(&serde_json::to_value(&user)?)
}

async fn run_about(ctx: &CliContext) -> Result<(), CliError> {
    let info = AppInfoClient::new(ctx.api.clone()).get().await?;
    print_json(&serde_json::to_value(&info)?)
}

async fn run_cookbooks(ctx: &CliContext, group: Option<String>) -> Result<(), CliError> {
    let books = match group {
        Some(slug) => {
            PublicCookbookStore::new(ctx.api.clone(), slug, SharedCookbooks::default())
                .refresh()
                .await?
        }
        None => {
            require_token(ctx)?;
            CookbookStore::new(ctx.api.clone(), SharedCookbooks::default())
                .refresh()
                .await?
        }
    };
    print_cookbooks(&books);
    Ok(())
}

async fn run_settings(ctx: &CliContext, settings: SettingsCommand) -> Result<(), CliError> {
    require_token(ctx)?;
    match settings.command {
        SettingsSubcommand::Get => {
            let settings = DetailedSettingsApi::new(ctx.api.clone()).get().await?;
            print_json(&serde_json::to_value(&settings)?)
        }
    }
}

// =============================================================================
// SHOPPING LISTS
// =============================================================================

async fn run_list(ctx: &CliContext, list: ListCommand) -> Result<(), CliError> {
    require_token(ctx)?;
    match list.command {
        ListSubcommand::Show { list_id, format, copy } => {
            let page = open_list(ctx, &list_id).await?;
            let text = render_copy_text(&page.items_by_label(), format);
            println!("{text}");
            if copy && !page.copy_list_items(format) {
                return Err(CliError::Clipboard(io::Error::other("no clipboard command succeeded")));
            }
            Ok(())
        }
        ListSubcommand::Watch { list_id } => run_watch(ctx, &list_id).await,
        ListSubcommand::AddRecipe { list_id, recipe_id } => {
            let page = open_list(ctx, &list_id).await?;
            page.add_recipe_reference(&recipe_id).await?;
            print_buckets(&page.items_by_label());
            Ok(())
        }
        ListSubcommand::RemoveRecipe { list_id, recipe_id } => {
            let page = open_list(ctx, &list_id).await?;
            page.remove_recipe_reference(&recipe_id).await?;
            print_buckets(&page.items_by_label());
            Ok(())
        }
    }
}

async fn open_list(ctx: &CliContext, list_id: &str) -> Result<ShoppingListPage, CliError> {
    let page = ShoppingListPage::connect(&ctx.api, &ctx.config, list_id, Arc::new(SystemClipboard));
    page.refresh().await;
    if page.list().is_none() {
        return Err(CliError::ListNotFound(list_id.to_owned()));
    }
    Ok(page)
}

async fn run_watch(ctx: &CliContext, list_id: &str) -> Result<(), CliError> {
    let page = open_list(ctx, list_id).await?;
    let mut revisions = page.data().subscribe();
    print_buckets(&page.items_by_label());
    page.start();

    let mut last = page.items_by_label();
    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                // A terminal session counts as active while it is watching.
                page.touch();
                let buckets = page.items_by_label();
                if buckets != last {
                    println!();
                    print_buckets(&buckets);
                    last = buckets;
                }
                if !page.data().is_polling() {
                    warn!(%list_id, "polling stopped after repeated failures");
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(CliError::Signal)?;
                break;
            }
        }
    }
    page.stop();
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_buckets(buckets: &[LabelBucket]) {
    println!("{}", render_copy_text(buckets, CopyFormat::Plain));
}

fn print_cookbooks(books: &[ReadCookbook]) {
    for book in books {
        let visibility = if book.public { "public" } else { "private" };
        println!("{:>3}  {:<24} {:<8} {}", book.position, book.slug, visibility, book.name);
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

// =============================================================================
// CLIPBOARD
// =============================================================================

/// Pipes text into the first platform clipboard command that accepts it.
struct SystemClipboard;

const CLIPBOARD_COMMANDS: &[(&str, &[&str])] = &[
    ("pbcopy", &[]),
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("xsel", &["--clipboard", "--input"]),
];

impl Clipboard for SystemClipboard {
    fn write_text(&self, text: &str) -> io::Result<()> {
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no clipboard command found");
        for (program, args) in CLIPBOARD_COMMANDS {
            match pipe_to(program, args, text) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(program, error = %e, "clipboard command failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn pipe_to(program: &str, args: &[&str], text: &str) -> io::Result<()> {
    let mut child = Process::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    // Close stdin before waiting so the child sees EOF; always reap it.
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(text.as_bytes()),
        None => Ok(()),
    };
    let status = child.wait()?;
    written?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{program} exited with {status}")))
    }
}
