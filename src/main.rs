mod collectors;
mod config;
mod metrics;
mod receiver;
mod report;
mod snapshot;
mod upload;

use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use collectors::system::SysinfoProbe;
use collectors::{CollectOptions, HostProbe};
use config::{Config, ConfigError};
use metrics::Metrics;
use std::path::{Path, PathBuf};
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use upload::Uploader;

#[derive(Parser, Debug)]
#[command(name = "sysdump")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides upload.endpoint
    #[arg(long)]
    endpoint: Option<String>,
    /// Overrides the upload token, including the one from the environment
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    no_upload: bool,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept uploaded reports over HTTP
    Serve,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        print!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Some(Command::Serve) => run_serve(cfg).await,
        None => run_collect(cfg, cli.no_upload).await,
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        cfg.upload.endpoint = endpoint.clone();
    }
    if let Some(token) = &cli.token {
        cfg.upload.token = Some(token.clone());
        cfg.upload.token_env.clear();
    }
    if let Some(dir) = &cli.output_dir {
        cfg.collect.output_dir = dir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn run_collect(cfg: Config, no_upload: bool) -> i32 {
    let uploader = if no_upload {
        None
    } else {
        match Uploader::new(
            cfg.upload.endpoint.clone(),
            cfg.upload.resolve_token(),
            cfg.upload.timeout(),
        ) {
            Ok(uploader) => Some(uploader),
            Err(err) => {
                error!(error = %err, "не удалось создать HTTP-клиент");
                return 1;
            }
        }
    };

    let host_id = report::resolve_host_id(
        |name| std::env::var(name).ok(),
        || System::host_name().unwrap_or_else(|| "localhost".to_string()),
    );
    let started_at = Local::now().naive_local();
    info!(
        host_id = %host_id,
        output_dir = %cfg.collect.output_dir.display(),
        upload = uploader.is_some(),
        "запуск sysdump"
    );

    let probe = SysinfoProbe::new();
    collect_and_ship(
        probe,
        cfg.collect.options(),
        &cfg.collect.output_dir,
        &host_id,
        &started_at,
        uploader.as_ref(),
    )
    .await
}

/// Returns the process exit code: 0 once the artifact is written and any
/// upload got an answer, 1 when it could not be written, 2 on transport failure.
async fn collect_and_ship<P>(
    mut probe: P,
    opts: CollectOptions,
    output_dir: &Path,
    host_id: &str,
    started_at: &NaiveDateTime,
    uploader: Option<&Uploader>,
) -> i32
where
    P: HostProbe + Send + 'static,
{
    let snapshot = match tokio::task::spawn_blocking(move || {
        collectors::collect(&mut probe, &opts)
    })
    .await
    {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = %err, "задача сбора завершилась аварийно");
            return 1;
        }
    };

    let artifact = match report::serialize(&snapshot).and_then(|layout| {
        let name = report::artifact_name(host_id, started_at);
        report::persist(&layout, output_dir, &name)
    }) {
        Ok(artifact) => artifact,
        Err(err) => {
            error!(error = %err, "не удалось сохранить отчёт");
            return 1;
        }
    };
    println!("Файл создан: {}", artifact.file_name());

    let Some(uploader) = uploader else {
        info!("отправка отключена флагом --no-upload");
        return 0;
    };
    match uploader.upload(&artifact).await {
        Ok(outcome) => {
            println!("Статус ответа: {}", outcome.status);
            println!("Ответ сервера: {}", outcome.body);
            if !outcome.is_success() {
                warn!(
                    endpoint = uploader.endpoint(),
                    status = outcome.status,
                    "сервер не принял отчёт"
                );
            }
            0
        }
        Err(err) => {
            println!("Ошибка при отправке: {err}");
            error!(
                endpoint = uploader.endpoint(),
                timeout = err.is_timeout(),
                error = %err,
                "отправка отчёта не удалась"
            );
            2
        }
    }
}

async fn run_serve(cfg: Config) -> i32 {
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(receiver::serve(cfg.receiver, metrics, shutdown_rx));

    tokio::select! {
        joined = &mut server => return server_exit_code(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "не удалось дождаться Ctrl+C");
            }
            info!("получен Ctrl+C, выполняется остановка");
        }
    }

    let _ = shutdown_tx.send(true);
    server_exit_code(server.await)
}

fn server_exit_code(joined: Result<std::io::Result<()>, JoinError>) -> i32 {
    match joined {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!(error = %err, "ошибка HTTP-сервера");
            1
        }
        Err(err) => {
            error!(error = %err, "задача HTTP-сервера завершилась аварийно");
            1
        }
    }
}
