use std::io;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use informes_core::api::ApiRequest;
use informes_core::auth::{
    AuthError, FileKeyValueStore, RestoreOutcome, Session, SessionManager,
};
use informes_core::config::ClientConfig;
use informes_core::services::{ProfileService, UserInfo};
use serde_json::{json, Value};
use tokio::task;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cliente de sesión para la API de informes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in, sign out and inspect the stored session
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Signed-in user details
    #[command(subcommand)]
    User(UserCommand),
    /// Send an authenticated request to any API path
    Api(ApiArgs),
    /// Password recovery
    #[command(subcommand)]
    Password(PasswordCommand),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in with email and password
    Login(LoginArgs),
    /// Forget the stored session for a profile
    Logout(ProfileArgs),
    /// Show the stored session
    Status(StatusArgs),
    /// Print the URL that starts a federated login
    FederatedUrl(FederatedUrlArgs),
    /// Complete a federated login from the redirect URL the browser landed on
    Callback(CallbackArgs),
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Show the profile of the signed-in user
    Me(MeArgs),
}

#[derive(Subcommand, Debug)]
enum PasswordCommand {
    /// Request a reset code by email
    Forgot(ForgotArgs),
    /// Check that a reset code is still valid
    Verify(VerifyArgs),
    /// Set a new password with a reset code
    Reset(ResetArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct ProfileArgs {
    /// Profile name for the stored session (defaults to INFORMES_PROFILE or "default")
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    email: String,
    /// Prompted on stdin when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct FederatedUrlArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long, default_value = "google")]
    provider: String,
}

#[derive(Args, Debug)]
struct CallbackArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    /// Full redirect URL, including its query string
    redirect: String,
}

#[derive(Args, Debug)]
struct MeArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum HttpVerb {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Args, Debug)]
struct ApiArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(value_enum)]
    verb: HttpVerb,
    /// Path relative to INFORMES_API_URL, or an absolute URL
    path: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
}

#[derive(Args, Debug)]
struct ForgotArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    email: String,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    token: String,
}

#[derive(Args, Debug)]
struct ResetArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    token: String,
    /// Prompted on stdin when omitted
    #[arg(long = "new-password")]
    new_password: Option<String>,
}

fn init_tracing() {
    // RUST_LOG overrides the default level, e.g. RUST_LOG=informes_core=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        if needs_login(&err) {
            eprintln!("Your session has ended. Run `informes auth login --email <email>` to sign in again.");
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(args).await?,
            AuthCommand::Logout(args) => auth_logout(args).await?,
            AuthCommand::Status(args) => auth_status(args).await?,
            AuthCommand::FederatedUrl(args) => auth_federated_url(args)?,
            AuthCommand::Callback(args) => auth_callback(args).await?,
        },
        Commands::User(cmd) => match cmd {
            UserCommand::Me(args) => user_me(args).await?,
        },
        Commands::Api(args) => api_request(args).await?,
        Commands::Password(cmd) => match cmd {
            PasswordCommand::Forgot(args) => password_forgot(args).await?,
            PasswordCommand::Verify(args) => password_verify(args).await?,
            PasswordCommand::Reset(args) => password_reset(args).await?,
        },
    }
    Ok(())
}

/// Whether the failure ended the stored session.
fn needs_login(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<AuthError>())
        .any(AuthError::is_session_terminal)
}

fn load_config(profile: &ProfileArgs) -> Result<ClientConfig> {
    let config = ClientConfig::from_env().context("invalid INFORMES_* environment")?;
    Ok(match &profile.profile {
        Some(name) => config.with_profile(name.clone()),
        None => config,
    })
}

fn build_manager(profile: &ProfileArgs) -> Result<SessionManager> {
    let config = load_config(profile)?;
    debug!(api = %config.api_base, profile = %config.profile, "using API");
    let storage = FileKeyValueStore::with_default_locator(config.profile.clone())
        .context("unable to initialise session storage")?;
    SessionManager::new(config, storage).context("failed to build API client")
}

/// Build a manager and rehydrate the stored session, renewing it if needed.
async fn open_session(profile: &ProfileArgs) -> Result<SessionManager> {
    let manager = build_manager(profile)?;
    match manager
        .start()
        .await
        .context("failed to restore stored session")?
    {
        RestoreOutcome::Empty => {
            return Err(anyhow!(
                "No stored session. Run `informes auth login --email <email>` first."
            ))
        }
        RestoreOutcome::Expired if !manager.session().is_authenticated() => {
            return Err(anyhow!(
                "Stored session expired and could not be renewed. Log in again."
            ))
        }
        _ => {}
    }
    Ok(manager)
}

async fn auth_login(args: LoginArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    let password = match args.password {
        Some(password) => password,
        None => prompt_line("Password: ").await?,
    };

    let session = manager
        .login(&args.email, &password)
        .await
        .context("login failed")?;
    println!("Login succeeded.");
    print_session(&session);
    Ok(())
}

async fn auth_logout(args: ProfileArgs) -> Result<()> {
    let manager = build_manager(&args)?;
    manager.logout();
    println!(
        "Deleted session for profile '{}'.",
        manager.auth_client().config().profile
    );
    Ok(())
}

async fn auth_status(args: StatusArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    manager
        .start()
        .await
        .context("failed to restore stored session")?;
    let session = manager.session();

    if args.json {
        let claims = session.claims();
        let value = json!({
            "status": session.status(),
            "profile": manager.auth_client().config().profile,
            "claims": claims,
            "expiresAt": claims.and_then(|c| c.expires_at_utc()).map(|at| at.to_rfc3339()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_session(&session);
    }
    Ok(())
}

fn auth_federated_url(args: FederatedUrlArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    let url = manager
        .federated_login_url(&args.provider)
        .context("failed to build federated login URL")?;
    println!("\nSign in by visiting:\n  {}\n", url);
    println!("Then run `informes auth callback '<redirect URL>'` with the address you land on.");
    Ok(())
}

async fn auth_callback(args: CallbackArgs) -> Result<()> {
    let redirect = Url::parse(args.redirect.trim()).context("invalid redirect URL")?;
    let manager = build_manager(&args.profile)?;
    manager
        .start()
        .await
        .context("failed to restore stored session")?;
    let session = manager
        .complete_federated_redirect(&redirect)
        .context("federated login failed")?;
    println!("Login succeeded.");
    print_session(&session);
    Ok(())
}

async fn user_me(args: MeArgs) -> Result<()> {
    let manager = open_session(&args.profile).await?;
    let profile = ProfileService::new(manager.executor().clone());
    let info = profile
        .user_info()
        .await
        .context("failed to load user info")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        render_user(&info);
    }
    Ok(())
}

async fn api_request(args: ApiArgs) -> Result<()> {
    let manager = open_session(&args.profile).await?;
    let mut request = match args.verb {
        HttpVerb::Get => ApiRequest::get(args.path),
        HttpVerb::Post => ApiRequest::post(args.path),
        HttpVerb::Put => ApiRequest::put(args.path),
        HttpVerb::Delete => ApiRequest::delete(args.path),
    };
    if let Some(body) = args.body {
        let body: Value = serde_json::from_str(&body).context("--body must be valid JSON")?;
        request = request.json(body);
    }

    let response = manager
        .executor()
        .execute(&request)
        .await
        .context("request failed")?;
    if !response.is_null() {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}

async fn password_forgot(args: ForgotArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    let message = manager
        .auth_client()
        .forgot_password(&args.email)
        .await
        .context("could not request a reset code")?;
    println!("{message}");
    Ok(())
}

async fn password_verify(args: VerifyArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    let message = manager
        .auth_client()
        .verify_reset_token(&args.token)
        .await
        .context("reset code rejected")?;
    println!("{message}");
    Ok(())
}

async fn password_reset(args: ResetArgs) -> Result<()> {
    let manager = build_manager(&args.profile)?;
    let new_password = match args.new_password {
        Some(password) => password,
        None => prompt_line("New password: ").await?,
    };
    let message = manager
        .auth_client()
        .reset_password(&args.token, &new_password)
        .await
        .context("could not reset password")?;
    println!("{message}");
    Ok(())
}

async fn prompt_line(prompt: &'static str) -> Result<String> {
    task::spawn_blocking(move || -> Result<String> {
        use std::io::Write;
        print!("{prompt}");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim_end_matches(['\r', '\n']).to_owned())
    })
    .await
    .context("input prompt was cancelled")?
}

fn print_session(session: &Session) {
    println!("Status: {:?}", session.status());
    if let Some(claims) = session.claims() {
        println!("User:   {}", claims.display_name());
        println!("Role:   {}", claims.role);
        if let Some(expiry) = claims.expires_at_utc() {
            println!("Token expires at {} (UTC).", expiry);
        }
    }
    if let Some(error) = session.last_error() {
        println!("Last error: {error}");
    }
}

fn render_user(info: &UserInfo) {
    if let Some(name) = info.full_name() {
        println!("{name}");
    }
    let fields = [
        ("Email", &info.email),
        ("Teléfono", &info.telefono),
        ("Género", &info.genero),
        ("Rol", &info.role),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("  {label:<9} {value}");
        }
    }
    for (key, value) in &info.extra {
        println!("  {key:<9} {value}");
    }
}
