use std::{sync::Arc, thread, time::Duration};

use actix_web::{middleware::from_fn, rt::System, web, App, HttpServer};
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::serve::Navigator;

mod error;
mod metrics;
mod serve;

pub struct AppState {
    pub navigator: Arc<Navigator>,
    pub metrics: PrometheusHandle,
}

#[derive(Parser, Debug)]
#[clap(
    version,
    about = "navigator serves every historical revision of the charts in a git repository as a Helm chart repository"
)]
struct Cli {
    /// HTTP listen address
    #[arg(long = "http-addr", default_value = ":8080")]
    http_addr: String,

    /// Poll interval for git repository updates
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Git repository to index, with an optional #dir[@index][,dir[@index]]
    /// fragment naming the directories to index
    #[arg(long = "url")]
    urls: Vec<String>,
}

fn parse_repository_url(value: &str) -> (String, Vec<String>) {
    match value.split_once('#') {
        Some((url, fragment)) if !fragment.is_empty() => (
            url.to_string(),
            fragment.split(',').map(str::to_string).collect(),
        ),
        Some((url, _)) => (url.to_string(), Vec::new()),
        None => (value.to_string(), Vec::new()),
    }
}

fn listen_addr(http_addr: &str) -> String {
    match http_addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => http_addr.to_string(),
    }
}

async fn run(state: web::Data<AppState>, addr: String) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .wrap(from_fn(metrics::middleware))
            .app_data(state.clone())
            .route("/health", web::get().to(serve::health))
            .route("/metrics", web::get().to(serve::prometheus))
            .default_service(web::to(serve::serve))
    })
    .bind(addr)?
    .run()
    .await
}

fn main() -> std::io::Result<()> {
    let mut log_builder = pretty_env_logger::formatted_builder();
    log_builder.parse_env(pretty_env_logger::env_logger::Env::default().default_filter_or("info"));
    log_builder.try_init().unwrap();

    let cli = Cli::parse();

    let handle = metrics::install();

    let mut navigator = Navigator::new();
    for value in &cli.urls {
        let (url, directories) = parse_repository_url(value);
        navigator.add_git_backed_repository(&url, &directories)?;
    }
    let navigator = Arc::new(navigator);

    // index everything once before serving
    navigator.update_repositories().map_err(std::io::Error::other)?;

    {
        let navigator = navigator.clone();
        let interval = cli.interval;
        thread::spawn(move || loop {
            thread::sleep(interval);
            if let Err(e) = navigator.update_repositories() {
                log::error!("error updating repositories: {e}");
            }
        });
    }

    let addr = listen_addr(&cli.http_addr);
    info!("listening on {addr}");

    let state = web::Data::new(AppState {
        navigator,
        metrics: handle,
    });
    System::new().block_on(run(state, addr))
}
