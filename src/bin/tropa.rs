use std::{collections::BTreeMap, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use reqwest::Client;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;
use tropa::{
    Error, Options, RawOptions, Reporter, Response, Scenario, ScenarioError, Scheduler,
    config::DEFAULT_BASE_URL,
    report::{JsonReporter, StdoutReporter},
    scenario::{Check, Classifier},
};

/// Runs a GET request per iteration against a base URL and gates on thresholds.
#[derive(Parser, Debug)]
#[command(name = "tropa", version, about, long_about = None)]
struct Cli {
    /// JSON options file. Flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    vus: Option<usize>,

    /// e.g. `30s`, `1m30s`
    #[arg(short, long)]
    duration: Option<String>,

    /// Iterations shared across all virtual users
    #[arg(short, long)]
    iterations: Option<u64>,

    #[arg(long)]
    think_time: Option<String>,

    #[arg(long)]
    graceful_stop: Option<String>,

    /// `METRIC=EXPRESSION`, e.g. `http_req_duration=p(95)<800`. Repeatable.
    #[arg(short, long = "threshold", value_name = "METRIC=EXPRESSION")]
    thresholds: Vec<String>,

    /// Falls back to the `BASE_URL` environment variable, then to the public
    /// restful-booker instance
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long, default_value = "/ping")]
    path: String,

    /// Statuses counted as success. Defaults to 200-399. Repeatable.
    #[arg(long = "expect-status", value_name = "STATUS")]
    expect_status: Vec<u16>,

    /// Adds a `latency < Nms` check
    #[arg(long, value_name = "MS")]
    max_latency: Option<u64>,

    /// Writes the run result as JSON
    #[arg(long, value_name = "PATH")]
    summary_export: Option<PathBuf>,
}

impl Cli {
    fn raw_options(&self) -> Result<RawOptions, Error> {
        let mut thresholds: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.thresholds {
            let (metric, expression) = entry.split_once('=').ok_or_else(|| Error::Config {
                field: "thresholds".to_owned(),
                reason: format!("`{entry}` is not METRIC=EXPRESSION"),
            })?;
            thresholds
                .entry(metric.trim().to_owned())
                .or_default()
                .push(expression.trim().to_owned());
        }
        Ok(RawOptions {
            vus: self.vus,
            duration: self.duration.clone(),
            iterations: self.iterations,
            think_time: self.think_time.clone(),
            graceful_stop: self.graceful_stop.clone(),
            thresholds,
            base_url: self.base_url.clone(),
        })
    }

    fn target_url(&self, options: &Options) -> String {
        let base_url = options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        if self.path.starts_with('/') {
            format!("{base_url}{}", self.path)
        } else {
            format!("{base_url}/{}", self.path)
        }
    }

    fn classifier(&self) -> Classifier {
        if self.expect_status.is_empty() {
            Classifier::default()
        } else {
            Classifier::expect_status(self.expect_status.clone())
        }
    }

    fn checks(&self) -> Vec<Check> {
        let mut checks: Vec<Check> = self
            .expect_status
            .iter()
            .map(|&status| Check::new(format!("status is {status}"), move |r| r.status == status))
            .collect();
        if let Some(ms) = self.max_latency {
            let limit = Duration::from_millis(ms);
            checks.push(Check::new(format!("latency < {ms}ms"), move |r| {
                r.duration < limit
            }));
        }
        checks
    }
}

async fn load_options(cli: &Cli) -> Result<Options, Error> {
    let file = match &cli.config {
        Some(path) => RawOptions::from_file(path).await?,
        None => RawOptions::default(),
    };
    Options::resolve(file.merge(cli.raw_options()?))
}

async fn run(cli: Cli) -> Result<i32, Error> {
    let options = load_options(&cli).await?;
    let url = cli.target_url(&options);
    tracing::info!("Target: {url}");

    // one client, cloned into every call
    let client = Client::new();
    let scenario = Scenario::builder()
        .name(format!("GET {}", cli.path))
        .action(move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let start = Instant::now();
                let res = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ScenarioError::new(e.to_string()))?;
                Ok::<_, ScenarioError>(Response::new(res.status().as_u16(), start.elapsed()))
            }
        })
        .classifier(cli.classifier())
        .checks(cli.checks())
        .think_time(options.think_time)
        .build();

    let result = Scheduler::from_options(&options)
        .run(&scenario, &options.thresholds)
        .await?;

    StdoutReporter.report(&result).await?;
    if let Some(path) = cli.summary_export {
        JsonReporter::new(path).report(&result).await?;
    }
    Ok(result.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
