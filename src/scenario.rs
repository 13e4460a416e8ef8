use std::{fmt, future::Future, marker::PhantomData, ops::RangeInclusive, sync::Arc, time::Duration};

use thiserror::Error;
use typed_builder::TypedBuilder;

/// What a scenario action reports back for one call.
///
/// The engine never talks to the network itself: the action decides how the
/// request is issued and how long it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub duration: Duration,
}

impl Response {
    pub fn new(status: u16, duration: Duration) -> Self {
        Self { status, duration }
    }
}

/// A call that did not produce a [`Response`] (connection refused, timeout...).
///
/// Recorded as a failed sample, never propagated.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ScenarioError(pub String);

impl ScenarioError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type Predicate = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Decides whether a [`Response`] counts as a success.
///
/// The default accepts any status in `200..=399`.
#[derive(Clone)]
pub struct Classifier {
    predicate: Predicate,
}

impl Classifier {
    pub fn new(predicate: impl Fn(&Response) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Success if the status is one of `statuses`.
    pub fn expect_status(statuses: impl IntoIterator<Item = u16>) -> Self {
        let statuses: Vec<u16> = statuses.into_iter().collect();
        Self::new(move |r| statuses.contains(&r.status))
    }

    pub fn expect_range(range: RangeInclusive<u16>) -> Self {
        Self::new(move |r| range.contains(&r.status))
    }

    pub fn classify(&self, response: &Response) -> bool {
        (self.predicate)(response)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::expect_range(200..=399)
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Classifier")
    }
}

/// A named assertion over a response. Each evaluation lands in the `checks`
/// metric; a failing check does not change the request outcome.
#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Predicate,
}

impl Check {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, response: &Response) -> bool {
        (self.predicate)(response)
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// Everything a virtual user needs to run one iteration: the action, how to judge
/// its result, and how long to pause afterwards.
///
/// ```rust
/// use std::time::Duration;
/// use tropa::{Response, Scenario, ScenarioError, scenario::{Check, Classifier}};
///
/// let scenario = Scenario::builder()
///     .name("ping")
///     .action(|| async { Ok::<_, ScenarioError>(Response::new(201, Duration::from_millis(40))) })
///     .classifier(Classifier::expect_status([201]))
///     .checks(vec![Check::new("status is 201", |r| r.status == 201)])
///     .think_time(Duration::from_secs(1))
///     .build();
/// assert_eq!(scenario.name, "ping");
/// ```
#[derive(TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default)]
    pub classifier: Classifier,
    #[builder(default)]
    pub checks: Vec<Check>,
    /// Pause between two iterations of the same virtual user.
    #[builder(default = Duration::ZERO)]
    pub think_time: Duration,
    #[builder(default, setter(skip))]
    response: PhantomData<fn() -> Fut>,
}

// Not derived: the future type itself is never cloned.
impl<F, Fut> Clone for Scenario<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: self.action.clone(),
            classifier: self.classifier.clone(),
            checks: self.checks.clone(),
            think_time: self.think_time,
            response: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> Response {
        Response::new(status, Duration::from_millis(10))
    }

    #[test]
    fn default_classifier_accepts_2xx_and_3xx() {
        let classifier = Classifier::default();
        assert!(classifier.classify(&response(200)));
        assert!(classifier.classify(&response(201)));
        assert!(classifier.classify(&response(304)));
        assert!(!classifier.classify(&response(404)));
        assert!(!classifier.classify(&response(500)));
    }

    #[test]
    fn expected_status_is_pluggable() {
        let classifier = Classifier::expect_status([201]);
        assert!(classifier.classify(&response(201)));
        assert!(!classifier.classify(&response(200)));

        let slow = Classifier::new(|r| r.duration < Duration::from_millis(5));
        assert!(!slow.classify(&response(200)));
    }

    #[test]
    fn builder_defaults() {
        let scenario = Scenario::builder()
            .name("defaults")
            .action(|| async { Ok::<_, ScenarioError>(response(200)) })
            .build();

        assert_eq!(scenario.think_time, Duration::ZERO);
        assert!(scenario.checks.is_empty());
        assert!(scenario.classifier.classify(&response(204)));
    }

    #[test]
    fn checks_keep_their_name() {
        let check = Check::new("latency < 800ms", |r| r.duration < Duration::from_millis(800));
        assert_eq!(check.name(), "latency < 800ms");
        assert!(check.evaluate(&response(500)));
    }
}
