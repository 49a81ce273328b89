use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{resolve_template, ResolutionContext, ResolutionResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchOptions {
    /// Stop at the first template that fails; later templates are not attempted.
    pub stop_on_first_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Counts cover only the templates actually attempted.
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub stopped_early: bool,
    /// Wall-clock time spent resolving, for reporting only.
    pub resolution_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// In caller order.
    pub results: IndexMap<String, ResolutionResult>,
    pub summary: BatchSummary,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool { self.summary.failed == 0 && !self.summary.stopped_early }
}

/// Resolves each `(key, template)` pair independently against one context.
pub fn batch_resolve<I, K, S>(templates: I, ctx: &ResolutionContext, stop_on_first_error: bool) -> BatchOutcome
where
    I: IntoIterator<Item = (K, S)>,
    K: Into<String>,
    S: AsRef<str>,
{
    batch_resolve_with(templates, ctx, &BatchOptions { stop_on_first_error })
}

pub fn batch_resolve_with<I, K, S>(templates: I, ctx: &ResolutionContext, options: &BatchOptions) -> BatchOutcome
where
    I: IntoIterator<Item = (K, S)>,
    K: Into<String>,
    S: AsRef<str>,
{
    let started = Instant::now();
    let mut results = IndexMap::new();
    let (mut total, mut successful, mut failed) = (0, 0, 0);
    let mut stopped_early = false;
    let mut remaining = templates.into_iter();

    for (key, template) in remaining.by_ref() {
        let key: String = key.into();
        let result = resolve_template(template.as_ref(), ctx);
        total += 1;
        let ok = result.success;
        if ok { successful += 1 } else { failed += 1 }
        results.insert(key.clone(), result);

        if !ok && options.stop_on_first_error {
            tracing::debug!(key = %key, "stopping batch at first failed template");
            stopped_early = true;
            break;
        }
    }
    if stopped_early && remaining.next().is_none() {
        stopped_early = false;
    }

    let summary = BatchSummary {
        total,
        successful,
        failed,
        stopped_early,
        resolution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    };
    tracing::info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        "resolved {} templates in {:.3}ms",
        summary.total,
        summary.resolution_time_ms
    );
    BatchOutcome { results, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use pretty_assertions::assert_eq;

    fn ctx() -> ResolutionContext {
        ResolutionContext::new()
            .with_service("api", Value::record([("url", Value::from("https://api"))]))
            .with_env("STAGE", "prod")
    }

    #[test]
    fn resolves_all_in_order() {
        let outcome = batch_resolve(
            vec![("b", "${env.STAGE}"), ("a", "${services.api.url}/v1"), ("c", "plain")],
            &ctx(),
            false,
        );
        let keys: Vec<_> = outcome.results.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(outcome.results["a"].resolved, "https://api/v1");
        assert_eq!(outcome.summary.total, 3);
        assert_eq!(outcome.summary.successful, 3);
        assert!(outcome.all_succeeded());
    }

    #[test]
    fn keeps_going_past_failures_by_default() {
        let outcome = batch_resolve([("x", "${env.NOPE}"), ("y", "${env.STAGE}")], &ctx(), false);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.successful, 1);
        assert!(!outcome.summary.stopped_early);
        assert!(!outcome.all_succeeded());
    }

    #[test]
    fn stop_on_first_error_leaves_rest_unattempted() {
        let outcome = batch_resolve(
            [("ok", "${env.STAGE}"), ("bad", "${services.gone.url}"), ("later", "${env.STAGE}")],
            &ctx(),
            true,
        );
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results.contains_key("later"));
        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.failed, 1);
        assert!(outcome.summary.stopped_early);
    }

    #[test]
    fn failure_on_last_template_is_not_an_early_stop() {
        let outcome = batch_resolve([("ok", "${env.STAGE}"), ("bad", "${env.GONE}")], &ctx(), true);
        assert_eq!(outcome.summary.total, 2);
        assert!(!outcome.summary.stopped_early);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: BatchOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.stop_on_first_error);
        let opts: BatchOptions = serde_json::from_str(r#"{"stopOnFirstError": true}"#).unwrap();
        assert!(opts.stop_on_first_error);
    }
}
