use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wirefront::config::{Mode, ServerConfig};
use wirefront::http::{Request, Response, StatusCode};
use wirefront::server::Server;

/// Pooled HTTP/1.1 and FastCGI front for a web application.
#[derive(Debug, Parser)]
#[command(name = "wirefront", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the config file.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// `http` or `fastcgi`; overrides the config file.
    #[arg(short, long)]
    mode: Option<Mode>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let server = Server::bind(config).await?;
    server
        .run_until(describe, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Stand-in application: reports what the transport reconstructed.
async fn describe(mut request: Request) -> Option<Response> {
    if request.path() == "favicon.ico" {
        return None;
    }
    let mut body = format!(
        "{} /{} {}\n",
        request.method(),
        request.path(),
        request.protocol()
    );
    for (name, value) in request.headers().iter() {
        body.push_str(&format!("header {name}: {value}\n"));
    }
    for (name, value) in request.query_params() {
        body.push_str(&format!("query {name} = {value}\n"));
    }
    for (name, value) in request.form_params() {
        body.push_str(&format!("form {name} = {value}\n"));
    }
    for file in request.take_uploads() {
        body.push_str(&format!(
            "upload {} ({} bytes) at {}\n",
            file.field_name(),
            file.size(),
            file.path().display()
        ));
    }
    if !request.body().is_empty() {
        body.push_str(&format!("body {} bytes\n", request.body().len()));
    }
    Some(Response::new(StatusCode::Ok).body(body))
}
