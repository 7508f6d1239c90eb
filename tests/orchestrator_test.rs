//! Tests for LoadOrchestrator: activation, failure accounting, escalation,
//! serialization and automatic fallback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{runtime, seed_store, test_config, ScriptedBackend};
use gg_orchestrator::catalog::{param, BackendType};
use gg_orchestrator::models::LoadError;
use gg_orchestrator::provider::{NativeError, Provider, ProviderState};

// ============================================================================
// Explicit load
// ============================================================================

#[tokio::test]
async fn test_load_activates_model() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));

    let handle = rt.try_load("alpha").await.unwrap();
    assert_eq!(handle.state(), ProviderState::Ready);
    assert_eq!(handle.backend_type(), BackendType::Direct);
    assert_eq!(rt.registry().active_name().as_deref(), Some("alpha"));

    let stored = rt.store().get("alpha").unwrap();
    assert!(stored.active);
    assert_eq!(stored.usage_count, 1);
    assert!(stored.last_used.is_some());
    assert_eq!(rt.ledger().count("alpha"), 0);
}

#[tokio::test]
async fn test_unknown_name_leaves_registry_untouched() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));
    rt.try_load("alpha").await.unwrap();
    let swaps = rt.registry().swap_count();

    let err = rt.try_load("does-not-exist").await.unwrap_err();
    assert!(matches!(err, LoadError::ConfigNotFound(ref n) if n == "does-not-exist"));
    assert_eq!(rt.registry().active_name().as_deref(), Some("alpha"));
    assert_eq!(rt.registry().swap_count(), swaps);
}

#[tokio::test]
async fn test_missing_file_keeps_active_model_and_counts_failure() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf"), ("beta", "beta.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));
    rt.try_load("alpha").await.unwrap();

    std::fs::remove_file(dir.path().join("beta.gguf")).unwrap();
    let err = rt.try_load("beta").await.unwrap_err();
    assert!(matches!(err, LoadError::ModelFileMissing { .. }));
    assert_eq!(rt.ledger().count("beta"), 1);
    assert_eq!(rt.registry().active_name().as_deref(), Some("alpha"));
}

#[tokio::test]
async fn test_switching_keeps_one_active() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf"), ("beta", "beta.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));

    let first = rt.try_load("alpha").await.unwrap();
    rt.try_load("beta").await.unwrap();

    assert_eq!(first.state(), ProviderState::Unloaded);
    let active: Vec<String> = rt
        .list_models()
        .into_iter()
        .filter(|c| c.active)
        .map(|c| c.name)
        .collect();
    assert_eq!(active, vec!["beta".to_string()]);
    assert_eq!(rt.get_active_model().unwrap().name, "beta");
}

#[tokio::test]
async fn test_unload() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));

    assert!(!rt.unload_model().await);
    rt.try_load("alpha").await.unwrap();
    assert!(rt.unload_model().await);
    assert!(rt.registry().is_empty());
    assert!(rt.store().active().is_none());
}

// ============================================================================
// Failure ledger
// ============================================================================

#[tokio::test]
async fn test_three_failures_then_success_resets_ledger() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let backend = Arc::new(ScriptedBackend::scripted(vec![
        NativeError::Runtime("one".into()),
        NativeError::Runtime("two".into()),
        NativeError::Runtime("three".into()),
    ]));
    let rt = runtime(test_config(dir.path()), backend);

    for expected in 1..=3 {
        let err = rt.try_load("alpha").await.unwrap_err();
        assert!(matches!(err, LoadError::InitializationFailure { attempts: 1, .. }));
        assert_eq!(rt.ledger().count("alpha"), expected);
    }
    assert!(rt.registry().is_empty());

    rt.try_load("alpha").await.unwrap();
    assert_eq!(rt.ledger().count("alpha"), 0);
}

#[tokio::test]
async fn test_failure_count_never_decreases_without_success() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "bad-alpha.gguf")]);
    let rt = runtime(
        test_config(dir.path()),
        Arc::new(ScriptedBackend::always_ok().failing_for("bad")),
    );

    let mut last = 0;
    for _ in 0..5 {
        let _ = rt.try_load("alpha").await;
        let now = rt.ledger().count("alpha");
        assert!(now > last);
        last = now;
    }
    rt.reset_failures("alpha").await;
    assert_eq!(rt.ledger().count("alpha"), 0);
}

// ============================================================================
// Direct fallback ladder
// ============================================================================

#[tokio::test]
async fn test_assertions_walk_fallback_ladder() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let backend = Arc::new(ScriptedBackend::scripted(vec![
        NativeError::Assertion("n_ctx".into()),
        NativeError::Assertion("n_batch".into()),
    ]));
    let rt = runtime(test_config(dir.path()), backend.clone());

    let handle = rt.try_load("alpha").await.unwrap();
    let Provider::Direct(direct) = handle.provider() else {
        panic!("expected direct provider");
    };
    assert_eq!(direct.attempted_params().len(), 3);
    let loaded = direct.loaded_params().unwrap();
    assert_eq!(loaded.n_ctx, 2048);
    assert_eq!(loaded.n_batch, 256);
    assert_eq!(backend.load_count(), 3);
    assert_eq!(rt.ledger().count("alpha"), 0);
}

#[tokio::test]
async fn test_cpu_only_set_loads_after_three_assertions() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let backend = Arc::new(ScriptedBackend::scripted(vec![
        NativeError::Assertion("n_ctx".into()),
        NativeError::Assertion("n_batch".into()),
        NativeError::Assertion("gpu".into()),
    ]));
    let rt = runtime(test_config(dir.path()), backend.clone());
    rt.store()
        .update("alpha", |c| {
            c.set_param(param::CONTEXT_SIZE, 8192u32);
            c.set_param(param::BATCH_SIZE, 1024u32);
            c.set_param(param::GPU_LAYERS, 35u32);
        })
        .unwrap();

    let handle = rt.try_load("alpha").await.unwrap();
    assert_eq!(handle.state(), ProviderState::Ready);

    let attempts: Vec<_> = backend
        .loaded_params()
        .into_iter()
        .map(|p| (p.n_ctx, p.n_batch, p.n_gpu_layers))
        .collect();
    assert_eq!(
        attempts,
        vec![(8192, 1024, 35), (2048, 1024, 35), (2048, 256, 35), (2048, 256, 0)]
    );
    let Provider::Direct(direct) = handle.provider() else {
        panic!("expected direct provider");
    };
    let loaded = direct.loaded_params().unwrap();
    assert!(loaded.n_ctx <= 2048 && loaded.n_batch <= 256);
    assert_eq!(loaded.n_gpu_layers, 0);
    assert_eq!(rt.ledger().count("alpha"), 0);
}

#[tokio::test]
async fn test_exhausted_ladder_is_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let backend = Arc::new(ScriptedBackend::scripted(
        (0..8).map(|i| NativeError::Assertion(format!("attempt {i}"))).collect(),
    ));
    let rt = runtime(test_config(dir.path()), backend.clone());

    let err = rt.try_load("alpha").await.unwrap_err();
    let LoadError::InitializationFailure { attempts, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(attempts, backend.load_count());
    assert!(backend.loaded_params().last().is_some_and(|p| p.n_gpu_layers == 0));
    assert_eq!(rt.ledger().count("alpha"), 1);
}

// ============================================================================
// Server escalation
// ============================================================================

#[tokio::test]
async fn test_failed_escalation_counts_once() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "bad-alpha.gguf")]);
    let mut config = test_config(dir.path());
    config.loading.allow_server_escalation = true;
    config.server.executable = Some("/nonexistent/llama-server".into());
    let rt = runtime(config, Arc::new(ScriptedBackend::always_ok().failing_for("bad")));

    let err = rt.try_load("alpha").await.unwrap_err();
    assert!(matches!(err, LoadError::InitializationFailure { .. }));
    assert_eq!(rt.ledger().count("alpha"), 1);
    assert_eq!(rt.store().get("alpha").unwrap().backend_type, BackendType::Direct);
}

#[tokio::test]
async fn test_escalation_disabled_per_model() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "bad-alpha.gguf")]);
    let mut config = test_config(dir.path());
    config.loading.allow_server_escalation = true;
    config.server.executable = Some("/nonexistent/llama-server".into());
    let rt = runtime(config, Arc::new(ScriptedBackend::always_ok().failing_for("bad")));
    rt.store()
        .update("alpha", |c| {
            c.set_param(gg_orchestrator::catalog::param::ALLOW_SERVER_FALLBACK, false)
        })
        .unwrap();

    let err = rt.try_load("alpha").await.unwrap_err();
    assert!(matches!(err, LoadError::InitializationFailure { .. }));
    assert_eq!(rt.ledger().count("alpha"), 1);
}

// ============================================================================
// Serialization
// ============================================================================

#[tokio::test]
async fn test_concurrent_loads_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf"), ("beta", "beta.gguf")]);
    let backend = Arc::new(ScriptedBackend::always_ok().with_load_delay(Duration::from_millis(100)));
    let rt = Arc::new(runtime(test_config(dir.path()), backend.clone()));

    let a = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.load_model("alpha").await })
    };
    let b = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.load_model("beta").await })
    };
    assert!(a.await.unwrap());
    assert!(b.await.unwrap());

    assert_eq!(backend.max_concurrent_loads(), 1);
    assert_eq!(rt.list_models().iter().filter(|c| c.active).count(), 1);
    assert!(rt.registry().active_name().is_some());
}

// ============================================================================
// Automatic fallback
// ============================================================================

#[tokio::test]
async fn test_fallback_skips_exhausted_models() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "bad-alpha.gguf"), ("beta", "beta.gguf")]);
    let rt = runtime(
        test_config(dir.path()),
        Arc::new(ScriptedBackend::always_ok().failing_for("bad")),
    );
    for _ in 0..3 {
        assert!(!rt.load_model("alpha").await);
    }

    let handle = rt.orchestrator().load_with_fallback(Some("alpha")).await.unwrap();
    assert_eq!(handle.name(), "beta");
    assert_eq!(rt.ledger().count("alpha"), 3);
}

#[tokio::test]
async fn test_fallback_prefers_requested_model() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("alpha", "alpha.gguf"), ("beta", "beta.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok()));
    rt.store().update("alpha", |c| c.usage_count = 10).unwrap();

    let ranked: Vec<String> = rt
        .orchestrator()
        .rank_candidates(Some("beta"))
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(ranked, vec!["beta", "alpha"]);

    let handle = rt.orchestrator().load_with_fallback(Some("beta")).await.unwrap();
    assert_eq!(handle.name(), "beta");
}

#[tokio::test]
async fn test_fallback_bound_schedules_warmup() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(
        dir.path(),
        &[("a", "bad-a.gguf"), ("b", "bad-b.gguf"), ("c", "c.gguf"), ("d", "bad-d.gguf")],
    );
    let mut config = test_config(dir.path());
    config.loading.fallback_attempt_bound = 2;
    config.loading.warmup_capacity = 1;
    let backend = Arc::new(ScriptedBackend::always_ok().failing_for("bad"));
    let rt = runtime(config, backend.clone());

    let err = rt.orchestrator().load_with_fallback(None).await.unwrap_err();
    let LoadError::NoCandidates { tried, skipped } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(tried, vec!["a", "b"]);
    assert!(skipped.is_empty());
    assert!(rt.registry().is_empty());

    rt.orchestrator().warmup().wait_idle().await;
    assert_eq!(rt.orchestrator().warmup().warm_names(), vec!["c"]);
    assert_eq!(rt.ledger().count("c"), 0);
    assert!(rt.registry().is_empty());

    let loads_before = backend.load_count();
    let handle = rt.try_load("c").await.unwrap();
    assert_eq!(handle.name(), "c");
    assert_eq!(backend.load_count(), loads_before, "warm handle should be adopted");
}

#[tokio::test]
async fn test_warmup_failures_are_logged_not_counted() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("a", "bad-a.gguf"), ("b", "bad-b.gguf")]);
    let mut config = test_config(dir.path());
    config.loading.fallback_attempt_bound = 1;
    let rt = runtime(config, Arc::new(ScriptedBackend::always_ok().failing_for("bad")));

    assert!(!rt.recover().await);
    rt.orchestrator().warmup().wait_idle().await;

    let errors = rt.preload_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].model, "b");
    assert_eq!(rt.ledger().count("b"), 0);
    assert_eq!(rt.ledger().count("a"), 1);
}

#[tokio::test]
async fn test_repeated_warmups_do_not_accumulate_tasks() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[("a", "bad-a.gguf")]);
    let rt = runtime(test_config(dir.path()), Arc::new(ScriptedBackend::always_ok().failing_for("bad")));
    let candidate = rt.store().get("a").unwrap();
    let warmup = rt.orchestrator().warmup();

    for round in 1..=5 {
        warmup.schedule(vec![candidate.clone()]);
        while warmup.errors().len() < round {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(warmup.task_count() <= 1);
    warmup.wait_idle().await;
    assert_eq!(warmup.task_count(), 0);
}
