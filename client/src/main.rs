//! ServerList CLI - Main entry point.
//!
//! Every command first restores the persisted session, then runs against
//! the configured Supabase project.
//!
//! # Configuration
//!
//! See [`serverlist_client::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! export SERVERLIST_SUPABASE_URL=https://xxx.supabase.co
//! export SERVERLIST_SUPABASE_ANON_KEY=your-anon-key
//!
//! serverlist login player@example.com
//! serverlist submit --name "Rusty Moose" --ip play.example.com:28015
//! serverlist admin random
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use serverlist_client::config::Config;
use serverlist_client::servers::{Server, ServerStatus};
use serverlist_client::session::SignupOutcome;
use serverlist_client::submissions::{ContentWarning, NewSubmission, ServerSubmission, ServerType};
use serverlist_client::validation::strip_whitespace;
use serverlist_client::ServerList;

/// Environment variable read instead of prompting for a password.
const PASSWORD_ENV: &str = "SERVERLIST_PASSWORD";

/// ServerList - community game server listings.
///
/// Submit servers, browse the ranked list and, as an admin, review
/// submissions.
#[derive(Parser, Debug)]
#[command(name = "serverlist")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SERVERLIST_SUPABASE_URL                Supabase project URL (required)
    SERVERLIST_SUPABASE_ANON_KEY           Supabase anon key (required)
    SERVERLIST_SITE_URL                    Site URL for reset links (default: http://localhost:5173)
    SERVERLIST_SESSION_CHECK_INTERVAL_SECS Session expiry check interval (default: 60)
    SERVERLIST_DATA_DIR                    Auth state directory (default: ~/.serverlist)
    SERVERLIST_PASSWORD                    Password to use instead of prompting (the prompt echoes input)
    RUST_LOG                               Log level filter (default: info)

EXAMPLES:
    # Sign in
    serverlist login player@example.com

    # Submit a server
    serverlist submit --name \"Rusty Moose\" --ip play.example.com:28015 --server-type modded

    # Change the Discord link of one of your submissions
    serverlist account edit 42 --discord discord.gg/moose

    # Follow the server list as it changes
    serverlist servers watch

    # Review a random unranked submission
    serverlist admin random
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password.
    Login { email: String },

    /// Create an account.
    Signup { email: String },

    /// Sign out.
    Logout,

    /// Show who is signed in.
    Status,

    /// Send a password reset email.
    ResetPassword { email: String },

    /// Change the password of the signed-in account.
    UpdatePassword,

    /// Submit a server for review.
    Submit {
        /// Server name.
        #[arg(long)]
        name: String,

        /// Address players connect to.
        #[arg(long)]
        ip: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, value_enum, default_value_t = Kind::Vanilla)]
        server_type: Kind,

        #[arg(long, default_value = "")]
        website: String,

        #[arg(long, default_value = "")]
        discord: String,

        /// Flag the server's content as needing a warning.
        #[arg(long)]
        content_warning: bool,
    },

    /// Show the ranked server list.
    Ranked,

    /// Show or edit your own submissions.
    Account {
        #[command(subcommand)]
        command: Option<AccountCommand>,
    },

    /// Review submissions (admins only).
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },

    /// Listed servers.
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// List your submissions (the default).
    List,

    /// Edit one of your submissions. Omitted flags keep their current value.
    Edit {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        ip: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, value_enum)]
        server_type: Option<Kind>,

        /// New website link. Pass an empty value to clear it.
        #[arg(long)]
        website: Option<String>,

        /// New Discord link. Pass an empty value to clear it.
        #[arg(long)]
        discord: Option<String>,

        #[arg(long)]
        content_warning: Option<bool>,
    },
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// List every submission.
    List,

    /// Rate a submission. An empty rating leaves it unranked.
    Review {
        id: String,

        #[arg(long, default_value = "")]
        rating: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Delete a submission.
    Delete { id: String },

    /// Show a random unranked submission.
    Random,
}

#[derive(Subcommand, Debug)]
enum ServersCommand {
    /// List servers, newest first.
    List,

    /// List servers and print the list again whenever it changes, until
    /// interrupted.
    Watch,

    /// Mark a server active or inactive (admins only).
    SetStatus { id: String, status: ServerStatus },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Vanilla,
    Modded,
}

impl From<Kind> for ServerType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Vanilla => ServerType::Vanilla,
            Kind::Modded => ServerType::Modded,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    let app = ServerList::connect(&config).context("Failed to initialize client")?;

    if let Err(err) = app.start().await {
        warn!(error = %err, "Could not restore the previous session");
    }

    let result = run(&app, cli.command).await;
    app.shutdown();
    result
}

async fn run(app: &ServerList, command: Command) -> Result<()> {
    match command {
        Command::Login { email } => {
            let password = read_password("Password")?;
            app.session().login(&email, &password).await?;
            let state = app.session().state();
            let role = state.role().map_or("none", |r| r.as_str());
            println!("Logged in (role: {role})");
        }
        Command::Signup { email } => {
            let password = read_password("Password")?;
            let confirmation = read_password("Confirm password")?;
            match app.session().signup_confirmed(&email, &password, &confirmation).await? {
                SignupOutcome::Authenticated => {
                    println!("Account created and signed in");
                }
                SignupOutcome::VerificationPending => {
                    if let Some(notice) = app.session().notice() {
                        println!("{notice}");
                    }
                }
            }
        }
        Command::Logout => {
            app.session().logout().await?;
            println!("Logged out");
        }
        Command::Status => print_status(app),
        Command::ResetPassword { email } => {
            app.session().reset_password(&email).await?;
            if let Some(notice) = app.session().notice() {
                println!("{notice}");
            }
        }
        Command::UpdatePassword => {
            app.require_auth()?;
            let password = read_password("New password")?;
            let confirmation = read_password("Confirm new password")?;
            app.session().update_password(&password, &confirmation).await?;
            if let Some(notice) = app.session().notice() {
                println!("{notice}");
            }
        }
        Command::Submit {
            name,
            ip,
            description,
            server_type,
            website,
            discord,
            content_warning,
        } => {
            let submission = NewSubmission {
                server_type: server_type.into(),
                description,
                name,
                server_ip: ip,
                website,
                discord,
                content_warning: if content_warning { ContentWarning::Yes } else { ContentWarning::No },
            };
            let uid = app.session().state().user.map(|u| u.id);
            app.submissions().create_submission(submission, uid).await?;
            println!("Thank you for your submission! We will review your server soon.");
        }
        Command::Ranked => {
            app.submissions().fetch_submissions().await?;
            let ranked = app.submissions().ranked();
            if ranked.is_empty() {
                println!("No ranked servers yet.");
            }
            for submission in &ranked {
                print_submission(submission);
            }
        }
        Command::Account { command } => run_account(app, command.unwrap_or(AccountCommand::List)).await?,
        Command::Admin { command } => run_admin(app, command).await?,
        Command::Servers { command } => run_servers(app, command).await?,
    }
    Ok(())
}

async fn run_account(app: &ServerList, command: AccountCommand) -> Result<()> {
    let user = app.require_auth()?;

    match command {
        AccountCommand::List => {
            if let Some(email) = &user.email {
                println!("Account: {email}");
            }
            let mine = app.submissions().fetch_for_user(&user.id).await?;
            println!("{} submission(s)", mine.len());
            for submission in &mine {
                print_submission(submission);
            }
        }
        AccountCommand::Edit {
            id,
            name,
            ip,
            description,
            server_type,
            website,
            discord,
            content_warning,
        } => {
            let mine = app.submissions().fetch_for_user(&user.id).await?;
            let current = mine
                .iter()
                .find(|s| s.id == id)
                .with_context(|| format!("No submission {id} on this account"))?;

            let mut form = NewSubmission::from(current);
            if let Some(name) = name {
                form.name = name;
            }
            if let Some(ip) = ip {
                form.server_ip = ip;
            }
            if let Some(description) = description {
                form.description = description;
            }
            if let Some(kind) = server_type {
                form.server_type = kind.into();
            }
            if let Some(website) = website {
                form.website = website;
            }
            if let Some(discord) = discord {
                form.discord = discord;
            }
            if let Some(flag) = content_warning {
                form.content_warning = if flag { ContentWarning::Yes } else { ContentWarning::No };
            }

            let mine = app.submissions().update_own_submission(&id, &user.id, form).await?;
            println!("Submission {id} updated");
            if let Some(updated) = mine.iter().find(|s| s.id == id) {
                print_submission(updated);
            }
        }
    }
    Ok(())
}

async fn run_admin(app: &ServerList, command: AdminCommand) -> Result<()> {
    app.require_admin()?;
    app.submissions().fetch_submissions().await?;

    match command {
        AdminCommand::List => {
            for submission in &app.submissions().submissions() {
                print_submission(submission);
            }
        }
        AdminCommand::Review { id, rating, notes } => {
            let review = app.submissions().review_submission(&id, &rating, &notes).await?;
            info!(submission_id = %id, rank = %review.rank, "Review saved");
            println!("Submission {id} is now {}", review.rank);
        }
        AdminCommand::Delete { id } => {
            app.submissions().delete_submission(&id).await?;
            println!("Submission {id} deleted");
        }
        AdminCommand::Random => match app.submissions().pick_unranked() {
            Some(submission) => print_submission(&submission),
            None => println!("No unranked servers available."),
        },
    }
    Ok(())
}

async fn run_servers(app: &ServerList, command: ServersCommand) -> Result<()> {
    match command {
        ServersCommand::List => {
            for server in &app.servers().fetch_servers().await? {
                print_server(server);
            }
        }
        ServersCommand::Watch => {
            let mut updates = app.servers().updates();
            let _subscription = app.servers().subscribe_to_servers(app.realtime())?;
            app.servers().fetch_servers().await?;

            loop {
                updates.borrow_and_update();
                println!("--- {} server(s) ---", app.servers().servers().len());
                for server in &app.servers().servers() {
                    print_server(server);
                }

                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        ServersCommand::SetStatus { id, status } => {
            app.require_admin()?;
            app.servers().fetch_servers().await?;
            app.servers().update_server_status(&id, status).await?;
            println!("Server {id} is now {status}");
        }
    }
    Ok(())
}

fn print_status(app: &ServerList) {
    let state = app.session().state();
    println!("Status: {:?}", state.status());
    if let Some(user) = &state.user {
        println!("User: {}", user.email.as_deref().unwrap_or(&user.id));
    }
    println!("Admin: {}", state.is_admin);
    if let Some(expires_at) = state.session_expiration {
        if let Some(when) = chrono::DateTime::from_timestamp(expires_at, 0) {
            println!("Session expires: {}", when.to_rfc3339());
        }
    }
    if let Some(error) = &state.error {
        println!("Last error: {error}");
    }
}

fn print_submission(submission: &ServerSubmission) {
    let rating: &str = if submission.rating.is_empty() { "N/A" } else { &submission.rating };
    println!(
        "{id}  {name} ({kind})  {ip}  rank: {rank}  rating: {rating}",
        id = submission.id,
        name = submission.name,
        kind = submission.server_type,
        ip = submission.server_ip,
        rank = submission.rank,
    );
    if !submission.description.is_empty() {
        println!("    {}", submission.description);
    }
    if !submission.notes.is_empty() {
        println!("    notes: {}", submission.notes);
    }
}

fn print_server(server: &Server) {
    println!(
        "{id}  {name}  {ip}  {status}",
        id = server.id,
        name = server.name.as_deref().unwrap_or("-"),
        ip = server.ip_address.as_deref().unwrap_or("-"),
        status = server.status,
    );
}

/// Reads a password from `SERVERLIST_PASSWORD` or stdin. Whitespace is
/// removed.
///
/// The stdin prompt does not hide what is typed; scripts and shared
/// terminals should set `SERVERLIST_PASSWORD` instead.
fn read_password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(strip_whitespace(&password));
    }

    eprint!("{prompt}: ");
    io::stderr().flush().context("Failed to write prompt")?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(strip_whitespace(&line))
}

/// Initializes logging to stderr, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(io::stderr)
        .init();
}
