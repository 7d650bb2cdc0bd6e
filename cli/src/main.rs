use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, SET_COOKIE};
use room::doc::DesignDraft;
use room::validate::validate_draft;
use serde_json::{Map, Value};

const SESSION_COOKIE: &str = "session_token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing session token; run `login` and pass --session-token or set DESIGNCRAFT_SESSION_TOKEN")]
    MissingSessionToken,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("server returned {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("login succeeded but no session cookie was returned")]
    MissingSessionCookie,
    #[error("design is invalid:\n{0}")]
    InvalidDesign(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "designcraft-cli", about = "DesignCraft designs API CLI")]
struct Cli {
    #[arg(long, env = "DESIGNCRAFT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "DESIGNCRAFT_SESSION_TOKEN")]
    session_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    session_token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    /// Log in and print the session token.
    Login {
        username: String,
        #[arg(long, env = "DESIGNCRAFT_PASSWORD")]
        password: String,
    },
    /// Show the logged-in user.
    Whoami,
    Design(DesignCommand),
    /// Show the furniture catalog.
    Catalog {
        #[arg(long)]
        category: Option<String>,
    },
}

#[derive(Args, Debug)]
struct DesignCommand {
    #[command(subcommand)]
    command: DesignSubcommand,
}

#[derive(Subcommand, Debug)]
enum DesignSubcommand {
    List {
        #[arg(long, help = "Only the N most recently updated designs")]
        recent: Option<u32>,
    },
    Show {
        id: String,
    },
    /// Write a design as an importable JSON document.
    Export {
        id: String,
        #[arg(long, default_value = "-", help = "Output file path, or - for stdout")]
        output: String,
    },
    /// Create a design from an exported JSON document.
    Import {
        #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
        input: String,
        #[arg(long, help = "Override the design name")]
        name: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, session_token: cli.session_token };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Login { username, password } => run_login(&ctx, &username, &password).await,
        Command::Whoami => {
            let json = api_request(&ctx, reqwest::Method::GET, "/api/user", &[], None).await?;
            print_json(&json)
        }
        Command::Design(design) => run_design(&ctx, design).await,
        Command::Catalog { category } => {
            let query = catalog_query(category.as_deref());
            let json = public_request(&ctx, reqwest::Method::GET, "/api/catalog", &query, None).await?.1;
            print_json(&json)
        }
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = http_client(HeaderMap::new())?;
    let response = client.get(url(cli, "/healthz")).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError { status: status.as_u16(), message: "health check failed".to_owned() });
    }
    println!("ok");
    Ok(())
}

async fn run_login(cli: &CliContext, username: &str, password: &str) -> Result<(), CliError> {
    let body = serde_json::json!({ "username": username, "password": password });
    let (headers, _) = public_request(cli, reqwest::Method::POST, "/api/login", &[], Some(body)).await?;
    let token = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(session_token_from_set_cookie)
        .ok_or(CliError::MissingSessionCookie)?;
    println!("{token}");
    Ok(())
}

async fn run_design(cli: &CliContext, design: DesignCommand) -> Result<(), CliError> {
    match design.command {
        DesignSubcommand::List { recent } => {
            let json = match recent {
                Some(n) => {
                    let limit = n.to_string();
                    api_request(cli, reqwest::Method::GET, "/api/designs/recent", &[("limit", limit.as_str())], None).await?
                }
                None => api_request(cli, reqwest::Method::GET, "/api/designs", &[], None).await?,
            };
            print_json(&json)
        }
        DesignSubcommand::Show { id } => {
            let json = api_request(cli, reqwest::Method::GET, &format!("/api/designs/{id}"), &[], None).await?;
            print_json(&json)
        }
        DesignSubcommand::Export { id, output } => {
            let json = api_request(cli, reqwest::Method::GET, &format!("/api/designs/{id}"), &[], None).await?;
            let rendered = serde_json::to_string_pretty(&export_document(json))?;
            if output == "-" {
                println!("{rendered}");
            } else {
                fs::write(&output, format!("{rendered}\n"))?;
                eprintln!("wrote {output}");
            }
            Ok(())
        }
        DesignSubcommand::Import { input, name } => {
            let raw = read_input(&input)?;
            let draft = import_draft(&raw, name)?;
            let json =
                api_request(cli, reqwest::Method::POST, "/api/designs", &[], Some(serde_json::to_value(&draft)?)).await?;
            print_json(&json)
        }
        DesignSubcommand::Delete { id } => {
            let json = api_request(cli, reqwest::Method::DELETE, &format!("/api/designs/{id}"), &[], None).await?;
            print_json(&json)
        }
    }
}

// =============================================================================
// HTTP
// =============================================================================

fn url(cli: &CliContext, path: &str) -> String {
    format!("{}{}", cli.base_url.trim_end_matches('/'), path)
}

fn http_client(headers: HeaderMap) -> Result<reqwest::Client, CliError> {
    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

async fn send(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    query: &[(&str, &str)],
    body: Option<Value>,
) -> Result<(HeaderMap, Value), CliError> {
    let request = client.request(method, url).query(query);
    let request = if let Some(json) = body { request.json(&json) } else { request };

    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError { status: status.as_u16(), message: error_message(&value) });
    }
    Ok((headers, value))
}

/// Request without a session cookie.
async fn public_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    query: &[(&str, &str)],
    body: Option<Value>,
) -> Result<(HeaderMap, Value), CliError> {
    let client = http_client(HeaderMap::new())?;
    send(&client, method, &url(cli, path), query, body).await
}

/// Request carrying the session cookie.
async fn api_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    query: &[(&str, &str)],
    body: Option<Value>,
) -> Result<Value, CliError> {
    let session_token = cli.session_token.as_deref().ok_or(CliError::MissingSessionToken)?;

    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_token}"))?);

    let client = http_client(headers)?;
    Ok(send(&client, method, &url(cli, path), query, body).await?.1)
}

// =============================================================================
// HELPERS
// =============================================================================

/// Query pairs for `GET /api/catalog`; values are percent-encoded by reqwest.
fn catalog_query(category: Option<&str>) -> Vec<(&'static str, &str)> {
    category.map(|c| vec![("category", c)]).unwrap_or_default()
}

/// The session token in a `Set-Cookie` header value, if it sets one.
fn session_token_from_set_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_owned())
}

/// Human-readable text from an API error body.
fn error_message(body: &Value) -> String {
    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return message.to_owned();
    }
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        return errors
            .iter()
            .map(|e| {
                let path = e.get("path").and_then(Value::as_str).unwrap_or("");
                let message = e.get("message").and_then(Value::as_str).unwrap_or("");
                format!("{path}: {message}")
            })
            .collect::<Vec<_>>()
            .join("; ");
    }
    body.to_string()
}

/// Strip server-owned fields from a design so it can be imported elsewhere.
fn export_document(mut design: Value) -> Value {
    if let Some(map) = design.as_object_mut() {
        for key in ["id", "userId", "createdAt", "updatedAt"] {
            map.remove(key);
        }
    }
    design
}

/// Parse and validate an exported design, optionally renaming it.
fn import_draft(raw: &str, name: Option<String>) -> Result<DesignDraft, CliError> {
    let mut value: Value = serde_json::from_str(raw)?;
    if let (Some(map), Some(name)) = (value.as_object_mut(), name) {
        map.insert("name".to_owned(), Value::String(name));
    }
    if let Some(map) = value.as_object_mut() {
        ensure_furniture_array(map);
    }
    let draft: DesignDraft = serde_json::from_value(value)?;
    if let Err(errors) = validate_draft(&draft) {
        let lines: Vec<String> = errors.iter().map(|e| format!("  {}: {}", e.path, e.message)).collect();
        return Err(CliError::InvalidDesign(lines.join("\n")));
    }
    Ok(draft)
}

fn ensure_furniture_array(map: &mut Map<String, Value>) {
    if !map.contains_key("furniture") {
        map.insert("furniture".to_owned(), Value::Array(Vec::new()));
    }
}

fn read_input(path: &str) -> Result<String, CliError> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    Ok(fs::read_to_string(path)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_is_read_from_set_cookie() {
        let header = "session_token=abc123; HttpOnly; SameSite=Lax; Path=/; Max-Age=604800";
        assert_eq!(session_token_from_set_cookie(header).as_deref(), Some("abc123"));
        assert_eq!(session_token_from_set_cookie("theme=dark; Path=/"), None);
        assert_eq!(session_token_from_set_cookie("session_token=; Max-Age=0"), None);
    }

    #[test]
    fn error_message_prefers_message_then_errors() {
        assert_eq!(error_message(&serde_json::json!({ "message": "Design not found" })), "Design not found");
        let body = serde_json::json!({ "errors": [
            { "path": "name", "message": "Design name is required" },
            { "path": "roomWidth", "message": "Room width must be positive" }
        ]});
        assert_eq!(
            error_message(&body),
            "name: Design name is required; roomWidth: Room width must be positive"
        );
        assert_eq!(error_message(&Value::Null), "null");
    }

    #[test]
    fn catalog_category_is_query_encoded() {
        let client = http_client(HeaderMap::new()).unwrap();
        let request = client
            .get("http://127.0.0.1:3000/api/catalog")
            .query(&catalog_query(Some("living room & more")))
            .build()
            .unwrap();
        assert_eq!(request.url().path(), "/api/catalog");
        assert_eq!(request.url().query(), Some("category=living+room+%26+more"));

        let request = client.get("http://127.0.0.1:3000/api/catalog").query(&catalog_query(None)).build().unwrap();
        assert_eq!(request.url().query(), None);
    }

    #[test]
    fn export_strips_server_fields() {
        let design = serde_json::json!({
            "id": 4, "userId": 1, "name": "Den", "createdAt": "x", "updatedAt": "y", "roomWidth": 10
        });
        assert_eq!(export_document(design), serde_json::json!({ "name": "Den", "roomWidth": 10 }));
    }

    #[test]
    fn import_validates_and_renames() {
        let raw = r##"{"name":"Den","roomWidth":10,"roomLength":12,"roomHeight":8,"wallColor":"#ffffff"}"##;
        let draft = import_draft(raw, Some("Copy of Den".into())).unwrap();
        assert_eq!(draft.name, "Copy of Den");
        assert!(draft.furniture.is_empty());
    }

    #[test]
    fn import_rejects_invalid_designs() {
        let raw = r##"{"name":"","roomWidth":0,"roomLength":12,"roomHeight":8,"wallColor":"#ffffff","furniture":[]}"##;
        let err = import_draft(raw, None).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("name: Design name is required"));
        assert!(text.contains("roomWidth: Room width must be positive"));
    }
}
