//! API fallback chain.
//!
//! A request first goes out over the provider's primary protocol with tools.
//! Certain failures before anything was rendered are retried over a simpler
//! combination:
//!
//! | failure                          | chain                                                   |
//! |----------------------------------|---------------------------------------------------------|
//! | tool schema / duplicate tool name | Responses+tools → Chat+tools → Chat without tools       |
//! | empty response                   | Responses+tools → Responses without tools → Chat without tools |
//!
//! Each (protocol, tools) combination runs at most once per call, so the
//! chain always terminates.  When it runs out, the first error is returned.

use std::collections::HashSet;
use std::future::Future;

use rb_domain::config::ApiKind;
use rb_domain::error::Error;
use rb_domain::trace::TraceEvent;

use crate::classify::{classify, ErrorClass};

/// One (protocol, tools) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attempt {
    pub api: ApiKind,
    pub tools_enabled: bool,
}

impl Attempt {
    /// The richest combination for a provider: its primary protocol with tools.
    pub fn primary(api: ApiKind) -> Self {
        Self { api, tools_enabled: true }
    }

    /// The next combination to try after `class`, skipping anything already
    /// visited.
    pub fn next(self, class: &ErrorClass, visited: &HashSet<Attempt>) -> Option<Attempt> {
        use ApiKind::{ChatCompletions as Chat, Responses};

        let chat_tools = Attempt { api: Chat, tools_enabled: true };
        let chat_bare = Attempt { api: Chat, tools_enabled: false };
        let responses_bare = Attempt { api: Responses, tools_enabled: false };

        let candidates: &[Attempt] = match (class, self.api, self.tools_enabled) {
            (ErrorClass::ToolSchema | ErrorClass::ToolUniqueness, Responses, true) => {
                &[chat_tools, chat_bare]
            }
            (ErrorClass::EmptyResponse, Responses, true) => &[responses_bare, chat_bare],
            (
                ErrorClass::ToolSchema | ErrorClass::ToolUniqueness | ErrorClass::EmptyResponse,
                Responses,
                false,
            ) => &[chat_bare],
            (
                ErrorClass::ToolSchema | ErrorClass::ToolUniqueness | ErrorClass::EmptyResponse,
                Chat,
                true,
            ) => &[chat_bare],
            _ => &[],
        };

        candidates.iter().copied().find(|a| !visited.contains(a))
    }
}

/// Errors that can say whether the fallback chain should handle them.
pub trait FallbackEligible {
    /// `Some(class)` when the failure should move on to the next attempt.
    fn fallback_class(&self) -> Option<ErrorClass>;
}

impl FallbackEligible for Error {
    fn fallback_class(&self) -> Option<ErrorClass> {
        let class = classify(self);
        class.triggers_fallback().then_some(class)
    }
}

/// Run `attempt_fn` over the fallback chain, starting at `initial`.
///
/// An error that is not fallback-eligible is returned as is.  When every
/// eligible step has been tried, the first error of the chain is returned.
pub async fn run_with_fallback<T, E, F, Fut>(initial: Attempt, mut attempt_fn: F) -> Result<T, E>
where
    E: FallbackEligible,
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut visited = HashSet::from([initial]);
    let mut current = initial;
    let mut first_err: Option<E> = None;

    loop {
        let err = match attempt_fn(current).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(class) = err.fallback_class() else {
            return Err(err);
        };

        let Some(next) = current.next(&class, &visited) else {
            tracing::debug!(
                api = %current.api,
                tools_enabled = current.tools_enabled,
                reason = class.label(),
                "fallback chain exhausted"
            );
            return Err(first_err.unwrap_or(err));
        };

        tracing::info!(
            from = %current.api,
            to = %next.api,
            tools_enabled = next.tools_enabled,
            reason = class.label(),
            "falling back"
        );
        TraceEvent::ApiFallback {
            from_api: current.api.to_string(),
            to_api: next.api.to_string(),
            tools_enabled: next.tools_enabled,
            reason: class.label().to_string(),
        }
        .emit();

        if first_err.is_none() {
            first_err = Some(err);
        }
        visited.insert(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, PartialEq)]
    struct TestErr(&'static str, Option<ErrorClass>);

    impl FallbackEligible for TestErr {
        fn fallback_class(&self) -> Option<ErrorClass> {
            self.1.clone()
        }
    }

    fn recorder() -> Arc<Mutex<Vec<Attempt>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn tool_schema_everywhere_stops_after_three_attempts() {
        let seen = recorder();
        let log = seen.clone();
        let mut n = 0;
        let result: Result<(), TestErr> =
            run_with_fallback(Attempt::primary(ApiKind::Responses), |a| {
                log.lock().unwrap().push(a);
                n += 1;
                let label = if n == 1 { "first" } else { "later" };
                async move { Err(TestErr(label, Some(ErrorClass::ToolSchema))) }
            })
            .await;

        assert_eq!(result.unwrap_err().0, "first");
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Attempt { api: ApiKind::Responses, tools_enabled: true },
                Attempt { api: ApiKind::ChatCompletions, tools_enabled: true },
                Attempt { api: ApiKind::ChatCompletions, tools_enabled: false },
            ]
        );
    }

    #[tokio::test]
    async fn empty_response_drops_tools_before_protocol() {
        let seen = recorder();
        let log = seen.clone();
        let result: Result<&str, TestErr> =
            run_with_fallback(Attempt::primary(ApiKind::Responses), |a| {
                log.lock().unwrap().push(a);
                async move {
                    if a.api == ApiKind::ChatCompletions {
                        Ok("ok")
                    } else {
                        Err(TestErr("empty", Some(ErrorClass::EmptyResponse)))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], Attempt { api: ApiKind::Responses, tools_enabled: false });
        assert_eq!(seen[2], Attempt { api: ApiKind::ChatCompletions, tools_enabled: false });
    }

    #[tokio::test]
    async fn ineligible_error_returns_immediately() {
        let seen = recorder();
        let log = seen.clone();
        let result: Result<(), TestErr> =
            run_with_fallback(Attempt::primary(ApiKind::Responses), |a| {
                log.lock().unwrap().push(a);
                async move { Err(TestErr("auth", None)) }
            })
            .await;

        assert_eq!(result.unwrap_err().0, "auth");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn later_ineligible_error_wins_over_original() {
        let mut n = 0;
        let result: Result<(), TestErr> =
            run_with_fallback(Attempt::primary(ApiKind::Responses), |_| {
                n += 1;
                let err = if n == 1 {
                    TestErr("schema", Some(ErrorClass::ToolUniqueness))
                } else {
                    TestErr("mid-stream", None)
                };
                async move { Err(err) }
            })
            .await;
        assert_eq!(result.unwrap_err().0, "mid-stream");
    }

    #[test]
    fn chat_primary_has_single_step() {
        let start = Attempt::primary(ApiKind::ChatCompletions);
        let visited = HashSet::from([start]);
        let next = start.next(&ErrorClass::ToolSchema, &visited).unwrap();
        assert_eq!(next, Attempt { api: ApiKind::ChatCompletions, tools_enabled: false });
        let visited = HashSet::from([start, next]);
        assert!(next.next(&ErrorClass::ToolSchema, &visited).is_none());
    }

    #[test]
    fn domain_error_eligibility() {
        let schema = Error::provider("p", "HTTP 400 - Invalid schema for function 'x'");
        assert_eq!(schema.fallback_class(), Some(ErrorClass::ToolSchema));
        assert!(Error::Timeout("idle".into()).fallback_class().is_none());
    }
}
