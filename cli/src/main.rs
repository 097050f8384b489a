use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use evshare_session::validation::{ValidationError, validate_email, validate_registration};
use evshare_session::{
    LoginCredentials, LoginOutcome, RegisterOutcome, RegistrationForm, SessionConfig, SessionError, SessionManager,
    SessionState,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("login failed: {0}")]
    LoginRejected(String),
    #[error("registration failed: {0}")]
    RegisterRejected(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("server returned error for {request}: {message}")]
    ServerError { request: String, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "evshare", about = "EV co-ownership session CLI")]
struct Cli {
    #[arg(long, env = "EVSHARE_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "EVSHARE_CREDENTIALS_PATH", help = "Where the session token is kept between runs")]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login(LoginArgs),
    Register(RegisterArgs),
    Logout,
    Status,
    Request(RequestArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    email: String,

    #[arg(long, env = "EVSHARE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    email: String,

    #[arg(long)]
    password: String,

    #[arg(long)]
    confirm_password: String,

    #[arg(long)]
    first_name: String,

    #[arg(long)]
    last_name: String,

    #[arg(long, default_value_t = false, help = "Send the form without local checks")]
    skip_validation: bool,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(help = "HTTP method, e.g. GET or POST")]
    method: String,

    #[arg(help = "Path relative to the API base URL, e.g. /vehicles")]
    path: String,

    #[arg(long, help = "JSON request body")]
    data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = build_config(cli.base_url.as_deref(), cli.credentials)?;
    tracing::debug!(
        base_url = %config.api_base_url,
        credentials = %config.credentials_path.display(),
        "session config loaded"
    );
    let manager = SessionManager::from_config(&config)?;

    match cli.command {
        Command::Login(args) => run_login(&manager, args).await,
        Command::Register(args) => run_register(&manager, args).await,
        Command::Logout => {
            manager.logout();
            println!("signed out");
            Ok(())
        }
        Command::Status => {
            print!("{}", render_status(&manager.state()));
            Ok(())
        }
        Command::Request(args) => run_request(&manager, args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn build_config(base_url: Option<&str>, credentials: Option<PathBuf>) -> Result<SessionConfig, CliError> {
    let mut config = SessionConfig::from_env()?;
    if let Some(base_url) = base_url {
        config = config.with_base_url(base_url)?;
    }
    if let Some(path) = credentials {
        config.credentials_path = path;
    }
    Ok(config)
}

async fn run_login(manager: &SessionManager, args: LoginArgs) -> Result<(), CliError> {
    validate_email(&args.email)?;
    match manager.login(&LoginCredentials::new(args.email.trim(), args.password)).await {
        LoginOutcome::Success { role } => {
            println!("signed in as {role}");
            Ok(())
        }
        LoginOutcome::Failed { error } => Err(CliError::LoginRejected(error)),
    }
}

async fn run_register(manager: &SessionManager, args: RegisterArgs) -> Result<(), CliError> {
    let form = RegistrationForm {
        email: args.email.trim().to_owned(),
        password: args.password,
        first_name: args.first_name.trim().to_owned(),
        last_name: args.last_name.trim().to_owned(),
        confirm_password: args.confirm_password,
    };
    if !args.skip_validation {
        validate_registration(&form)?;
    }
    match manager.register(&form).await {
        RegisterOutcome::Success { message } => {
            println!("{message}");
            println!("run `evshare login` to sign in");
            Ok(())
        }
        RegisterOutcome::Failed { error } => Err(CliError::RegisterRejected(error)),
    }
}

async fn run_request(manager: &SessionManager, args: RequestArgs) -> Result<(), CliError> {
    let method = parse_method(&args.method)?;
    let request_label = format!("{method} {}", args.path);

    let request = manager.client().request(method, &args.path);
    let request = match args.data.as_deref() {
        Some(raw) => request.json(&serde_json::from_str::<Value>(raw)?),
        None => request,
    };

    let response = request.send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);

    if !status.is_success() {
        if status.as_u16() == 401 && manager.state().is_authenticated() {
            eprintln!("stored session was rejected; run `evshare logout` and sign in again");
        }
        return Err(CliError::ServerError {
            request: format!("{request_label} (HTTP {})", status.as_u16()),
            message: value.to_string(),
        });
    }

    print_json(&value)
}

fn parse_method(raw: &str) -> Result<reqwest::Method, CliError> {
    reqwest::Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(raw.to_owned()))
}

fn render_status(state: &SessionState) -> String {
    if !state.is_authenticated() {
        return "signed out\n".to_owned();
    }
    let role = if state.role.is_empty() { "(unknown)" } else { state.role.as_str() };
    let email = match &state.user {
        Some(user) if !user.email.is_empty() => user.email.as_str(),
        _ => "(restored session)",
    };
    format!("signed in\nrole: {role}\nuser: {email}\n")
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evshare_session::SessionUser;

    #[test]
    fn parse_method_is_case_insensitive() {
        assert_eq!(parse_method("get").unwrap(), reqwest::Method::GET);
        assert_eq!(parse_method(" Patch ").unwrap(), reqwest::Method::PATCH);
        assert!(matches!(parse_method("GE T"), Err(CliError::InvalidMethod(_))));
    }

    #[test]
    fn status_for_signed_out_session() {
        assert_eq!(render_status(&SessionState::default()), "signed out\n");
    }

    #[test]
    fn status_never_prints_token() {
        let state = SessionState {
            token: "secret-token".to_owned(),
            role: "Staff".to_owned(),
            user: Some(SessionUser { email: "staff@evshare.vn".to_owned(), role: "Staff".to_owned() }),
            loading: false,
        };
        let rendered = render_status(&state);
        assert_eq!(rendered, "signed in\nrole: Staff\nuser: staff@evshare.vn\n");
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn status_for_restored_session() {
        let state = SessionState {
            token: "t".to_owned(),
            role: "Admin".to_owned(),
            user: Some(SessionUser { email: String::new(), role: "Admin".to_owned() }),
            loading: false,
        };
        assert_eq!(render_status(&state), "signed in\nrole: Admin\nuser: (restored session)\n");
    }

    #[test]
    fn cli_parses_login_flags() {
        let cli = Cli::try_parse_from([
            "evshare",
            "--base-url",
            "http://localhost:5000/api",
            "login",
            "--email",
            "owner@evshare.vn",
            "--password",
            "s3cretpass",
        ])
        .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("http://localhost:5000/api"));
        assert!(matches!(cli.command, Command::Login(LoginArgs { ref email, .. }) if email == "owner@evshare.vn"));
    }
}
