//! Resilient Client Integration Tests
//!
//! Fallback chain traversal, retry, auth abort, caching and rate limiting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use verifact::adapters::{
    ChatMessage, CompletionRequest, CompletionResponse, ParameterOverrides, Provider, ProviderError,
    TokenUsage,
};
use verifact::core::{
    Cache, FallbackChain, ModelError, RateLimitSettings, RateLimiter, ResilientCallClient,
    RetryPolicy,
};

/// Fails with `error` for the first `failures` calls, then answers
struct Scripted {
    name: String,
    failures: u32,
    error: Option<ProviderError>,
    calls: AtomicU32,
}

impl Scripted {
    fn ok(name: &str) -> Arc<Self> {
        Self::failing(name, 0, None)
    }

    fn always(name: &str, error: ProviderError) -> Arc<Self> {
        Self::failing(name, u32::MAX, Some(error))
    }

    fn failing(name: &str, failures: u32, error: Option<ProviderError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            if let Some(ref error) = self.error {
                return Err(error.clone());
            }
        }
        Ok(CompletionResponse {
            content: format!("{} answered {} messages", self.name, request.messages.len()),
            model: self.name.clone(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

fn chain(providers: &[&Arc<Scripted>]) -> FallbackChain {
    FallbackChain::new(
        providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Provider>)
            .collect(),
    )
}

fn messages(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system("Be brief."), ChatMessage::user(text)]
}

fn unavailable() -> ProviderError {
    ProviderError::Unavailable("overloaded".to_string())
}

#[tokio::test]
async fn test_transient_failure_falls_through_to_next_provider() {
    let p1 = Scripted::always("p1", unavailable());
    let p2 = Scripted::ok("p2");
    let p3 = Scripted::ok("p3");
    let client = ResilientCallClient::new("detect", chain(&[&p1, &p2, &p3]));

    for i in 0..3 {
        let completion = client
            .complete(messages(&format!("question {}", i)), &ParameterOverrides::default())
            .await
            .unwrap();
        assert_eq!(completion.provider, "p2");
        assert!(!completion.cached);
    }

    assert_eq!(p1.calls(), 3);
    assert_eq!(p2.calls(), 3);
    assert_eq!(p3.calls(), 0);
}

#[tokio::test]
async fn test_auth_failure_aborts_chain() {
    let p1 = Scripted::always("p1", ProviderError::Authentication("invalid key".to_string()));
    let p2 = Scripted::ok("p2");
    let client = ResilientCallClient::new("detect", chain(&[&p1, &p2]));

    let err = client
        .complete(messages("hello"), &ParameterOverrides::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Authentication { ref provider, .. } if provider == "p1"));
    assert_eq!(p1.calls(), 1);
    assert_eq!(p2.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_errors_retry_same_provider() {
    let p1 = Scripted::failing("p1", 2, Some(ProviderError::Timeout(Duration::from_secs(30))));
    let p2 = Scripted::ok("p2");
    let client = ResilientCallClient::new("verdict", chain(&[&p1, &p2]))
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(100)));

    let completion = client
        .complete(messages("hello"), &ParameterOverrides::default())
        .await
        .unwrap();

    assert_eq!(completion.provider, "p1");
    assert_eq!(p1.calls(), 3);
    assert_eq!(p2.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_then_next_provider() {
    let p1 = Scripted::always("p1", ProviderError::RateLimited { retry_after: None });
    let p2 = Scripted::ok("p2");
    let client = ResilientCallClient::new("verdict", chain(&[&p1, &p2]))
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(100)));

    let completion = client
        .complete(messages("hello"), &ParameterOverrides::default())
        .await
        .unwrap();

    assert_eq!(completion.provider, "p2");
    assert_eq!(p1.calls(), 2);
}

#[tokio::test]
async fn test_exhausted_chain_reports_every_provider() {
    let p1 = Scripted::always("p1", unavailable());
    let p2 = Scripted::always("p2", ProviderError::BadRequest {
        status: 400,
        message: "context too long".to_string(),
    });
    let client = ResilientCallClient::new("evidence", chain(&[&p1, &p2]));

    let err = client
        .complete(messages("hello"), &ParameterOverrides::default())
        .await
        .unwrap_err();

    match err {
        ModelError::Exhausted {
            operation,
            attempted,
            last_error,
        } => {
            assert_eq!(operation, "evidence");
            assert_eq!(attempted, vec!["p1", "p2"]);
            assert!(matches!(last_error, ProviderError::BadRequest { status: 400, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.usage(), TokenUsage::default());
}

#[tokio::test]
async fn test_cache_hit_replays_provider_without_usage() {
    let p1 = Scripted::always("p1", unavailable());
    let p2 = Scripted::ok("p2");
    let client = ResilientCallClient::new("detect", chain(&[&p1, &p2]))
        .with_cache(Arc::new(Cache::in_memory()), None);

    let first = client
        .complete(messages("same"), &ParameterOverrides::default())
        .await
        .unwrap();
    let second = client
        .complete(messages("same"), &ParameterOverrides::default())
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.provider, "p2");
    assert_eq!(second.content(), first.content());
    assert_eq!(p2.calls(), 1);
    assert_eq!(client.usage().total_tokens, 15);

    // Different parameters are a different request
    let overrides = ParameterOverrides {
        temperature: Some(0.9),
        ..Default::default()
    };
    let third = client.complete(messages("same"), &overrides).await.unwrap();
    assert!(!third.cached);
    assert_eq!(client.usage().total_tokens, 30);
}

#[tokio::test]
async fn test_streaming_calls_bypass_cache() {
    let p1 = Scripted::ok("p1");
    let client = ResilientCallClient::new("detect", chain(&[&p1]))
        .with_cache(Arc::new(Cache::in_memory()), None);
    let streaming = ParameterOverrides {
        stream: Some(true),
        ..Default::default()
    };

    client.complete(messages("same"), &streaming).await.unwrap();
    let again = client.complete(messages("same"), &streaming).await.unwrap();

    assert!(!again.cached);
    assert_eq!(p1.calls(), 2);
}

#[tokio::test]
async fn test_rate_limiter_gates_upstream_calls() {
    let p1 = Scripted::ok("p1");
    let limiter = Arc::new(RateLimiter::new(&RateLimitSettings {
        default_limit: 2,
        ..Default::default()
    }));
    let client = ResilientCallClient::new("detect", chain(&[&p1]))
        .with_rate_limiter(limiter, "tester");

    for i in 0..2 {
        client
            .complete(messages(&i.to_string()), &ParameterOverrides::default())
            .await
            .unwrap();
    }
    let err = client
        .complete(messages("one too many"), &ParameterOverrides::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::RateLimited { retry_after: Some(_) }));
    assert_eq!(p1.calls(), 2);
}

#[tokio::test]
async fn test_usage_accumulates_and_resets() {
    let p1 = Scripted::ok("p1");
    let client = ResilientCallClient::new("detect", chain(&[&p1]));

    client.complete(messages("a"), &ParameterOverrides::default()).await.unwrap();
    client.complete(messages("b"), &ParameterOverrides::default()).await.unwrap();
    assert_eq!(
        client.usage(),
        TokenUsage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30
        }
    );

    client.reset_usage();
    assert_eq!(client.usage(), TokenUsage::default());
}

#[tokio::test]
async fn test_parameter_updates_are_validated() {
    let client = ResilientCallClient::new("detect", chain(&[&Scripted::ok("p1")]));

    client
        .set_parameter("temperature", serde_json::json!(0.7))
        .unwrap();
    assert_eq!(client.parameters().temperature, 0.7);

    assert!(client.set_parameter("not_a_parameter", serde_json::json!(1)).is_err());
    // A failed batch update leaves every parameter untouched
    assert!(client
        .update_parameters(vec![
            ("max_tokens".to_string(), serde_json::json!(50)),
            ("bogus".to_string(), serde_json::json!(true)),
        ])
        .is_err());
    assert_eq!(client.parameters().max_tokens, 1000);
}
