use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;
use tropa::{
    Reporter, Response, Scenario, ScenarioError, Scheduler, ThresholdSpec,
    config::{BASE_URL_ENV, DEFAULT_BASE_URL},
    report::StdoutReporter,
    scenario::{Check, Classifier},
};

#[tokio::main]
async fn main() -> tropa::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.into());
    let url = format!("{base_url}/ping");

    // Never build the client inside the action
    let client = Client::new();
    let scenario = Scenario::builder()
        .name("ping")
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
        .classifier(Classifier::expect_status([201]))
        .checks(vec![
            Check::new("status is 201", |r| r.status == 201),
            Check::new("latency < 800ms", |r| r.duration < Duration::from_millis(800)),
        ])
        .think_time(Duration::from_secs(1))
        .build();

    let thresholds = vec![
        ThresholdSpec::parse("http_req_failed", "rate<0.01")?,
        ThresholdSpec::parse("http_req_duration", "p(95)<800")?,
    ];

    let result = Scheduler::builder()
        .vus(5)
        .duration(Duration::from_secs(30))
        .build()
        .run(&scenario, &thresholds)
        .await?;

    StdoutReporter.report(&result).await?;
    std::process::exit(result.exit_code());
}
