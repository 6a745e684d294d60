use pretty_assertions::assert_eq;
use proptest::prelude::*;
use scoped_context::prelude::*;
use scoped_context::SessionStoreKind;
use scoped_store::{MemoryRequest, MemorySession, SessionCreationListener};
use scoped_test_utils::{new_log, RecordingContextual, StagingListener};
use std::sync::Arc;

fn on_session(session: &Arc<MemorySession>) -> Arc<dyn RequestHost> {
    Arc::new(MemoryRequest::new().with_session(Arc::clone(session)))
}

#[test]
fn test_request_instances_are_per_request() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let recording = RecordingContextual::new("req.Form");
    let bean: Arc<dyn Contextual> = recording.clone();
    let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());

    for _ in 0..3 {
        let mut scope = lifecycle.begin_request(&request);
        let first = scope.get_or_create(ScopeType::Request, &bean).unwrap();
        let second = scope.get_or_create(ScopeType::Request, &bean).unwrap();
        assert!(first.ptr_eq(&second));
    }
    assert_eq!(recording.created(), 3);
    assert_eq!(recording.destroyed(), 3);
}

#[test]
fn test_request_cache_follows_request_bounds() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let bean: Arc<dyn Contextual> = RecordingContextual::new("req.Form");
    let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());
    let generation = lifecycle.cache().generation();

    {
        let mut scope = lifecycle.begin_request(&request);
        assert!(scope.cache().is_active());
        scope.get_or_create(ScopeType::Request, &bean).unwrap();
    }
    assert!(!lifecycle.cache().is_active());
    assert!(lifecycle.cache().generation() > generation);
}

#[test]
fn test_contexts_inactive_outside_requests() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let bean: Arc<dyn Contextual> = RecordingContextual::new("req.Form");

    for scope in [ScopeType::Request, ScopeType::Session, ScopeType::Conversation] {
        assert!(!lifecycle.context_for(scope).is_active());
        let err = lifecycle.get_or_create(scope, &bean).unwrap_err();
        assert!(err.is_not_active(), "{scope}: {err}");
    }
}

#[test]
fn test_read_only_request_never_creates_session() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let bean: Arc<dyn Contextual> = RecordingContextual::new("shop.Cart");
    let request = Arc::new(MemoryRequest::new());
    let host: Arc<dyn RequestHost> = request.clone();

    {
        let mut scope = lifecycle.begin_request(&host);
        let found = scope
            .context_for(ScopeType::Session)
            .get(&bean.identifier())
            .unwrap();
        assert!(found.is_none());
    }
    assert_eq!(request.sessions_created(), 0);
}

#[test]
fn test_session_write_creates_session_once() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let bean: Arc<dyn Contextual> = RecordingContextual::new("shop.Cart");
    let request = Arc::new(MemoryRequest::new());
    let host: Arc<dyn RequestHost> = request.clone();

    {
        let mut scope = lifecycle.begin_request(&host);
        scope.get_or_create(ScopeType::Session, &bean).unwrap();
        scope.get_or_create(ScopeType::Session, &bean).unwrap();
    }
    assert_eq!(request.sessions_created(), 1);
    assert!(request.current_session().is_some_and(|s| s.attribute_count() > 0));
}

#[test]
fn test_lazy_cyclic_store_keeps_listener_writes() {
    let config = ContextConfig::new().with_session_store(SessionStoreKind::LazyCyclic);
    let staged = RecordingContextual::new("shop.Preferences");
    let listener = StagingListener::new(Arc::clone(&staged));
    let mut lifecycle = ContextLifecycle::new(config)
        .with_session_listener(Arc::clone(&listener) as Arc<dyn SessionCreationListener>);
    let cart = RecordingContextual::new("shop.Cart");
    let cart_bean: Arc<dyn Contextual> = cart.clone();
    let staged_bean: Arc<dyn Contextual> = staged.clone();
    let request = Arc::new(MemoryRequest::new());
    let host: Arc<dyn RequestHost> = request.clone();

    {
        let mut scope = lifecycle.begin_request(&host);
        scope.get_or_create(ScopeType::Session, &cart_bean).unwrap();
        let found = scope
            .context_for(ScopeType::Session)
            .get(&staged_bean.identifier())
            .unwrap();
        assert!(found.is_some());
    }
    assert_eq!(listener.calls(), 1);
    assert_eq!(request.sessions_created(), 1);
}

#[test]
fn test_session_destroyed_out_of_band() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let log = new_log();
    let cart = RecordingContextual::logged("shop.Cart", &log);
    let bean: Arc<dyn Contextual> = cart.clone();
    let session = MemorySession::new();
    {
        let mut scope = lifecycle.begin_request(&on_session(&session));
        scope.get_or_create(ScopeType::Session, &bean).unwrap();
    }

    session.invalidate();
    let dying: Arc<dyn SessionHost> = session.clone();
    assert!(lifecycle.session_destroyed(&dying));
    assert_eq!(log.lock().len(), 1);
    assert_eq!(session.attribute_count(), 0);
    assert!(!lifecycle.destruction_context().is_associated());
}

#[test]
fn test_session_destroyed_during_request_waits_for_request_end() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let cart = RecordingContextual::new("shop.Cart");
    let bean: Arc<dyn Contextual> = cart.clone();
    let session = MemorySession::new();
    let dying: Arc<dyn SessionHost> = session.clone();

    {
        let mut scope = lifecycle.begin_request(&on_session(&session));
        scope.get_or_create(ScopeType::Session, &bean).unwrap();
        session.invalidate();
        assert!(!scope.session_destroyed(&dying));
        assert_eq!(cart.destroyed(), 0);
    }
    assert_eq!(cart.destroyed(), 1);
}

#[test]
fn test_session_destroyed_exactly_once_across_both_paths() {
    let mut in_request = ContextLifecycle::new(ContextConfig::new());
    let mut other_worker = ContextLifecycle::new(ContextConfig::new());
    let cart = RecordingContextual::new("shop.Cart");
    let bean: Arc<dyn Contextual> = cart.clone();
    let session = MemorySession::new();
    let dying: Arc<dyn SessionHost> = session.clone();

    {
        let mut scope = in_request.begin_request(&on_session(&session));
        scope.get_or_create(ScopeType::Session, &bean).unwrap();
        session.invalidate();
        assert!(!scope.session_destroyed(&dying));
        assert!(other_worker.session_destroyed(&dying));
        assert_eq!(cart.destroyed(), 1);
    }
    assert_eq!(cart.destroyed(), 1);
}

#[test]
fn test_failing_destruction_does_not_stop_the_rest() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let failing = RecordingContextual::failing("a.Failing");
    let panicking = RecordingContextual::panicking("b.Panicking");
    let healthy = RecordingContextual::new("c.Healthy");
    let session = MemorySession::new();
    {
        let mut scope = lifecycle.begin_request(&on_session(&session));
        for bean in [&failing, &panicking, &healthy] {
            let bean: Arc<dyn Contextual> = bean.clone();
            scope.get_or_create(ScopeType::Session, &bean).unwrap();
        }
    }

    session.invalidate();
    let dying: Arc<dyn SessionHost> = session.clone();
    lifecycle.session_destroyed(&dying);
    assert_eq!(failing.destroyed(), 1);
    assert_eq!(panicking.destroyed(), 1);
    assert_eq!(healthy.destroyed(), 1);
    assert_eq!(session.attribute_count(), 0);
}

#[test]
fn test_request_ends_even_when_handler_panics() {
    let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
    let recording = RecordingContextual::new("req.Form");
    let bean: Arc<dyn Contextual> = recording.clone();
    let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut scope = lifecycle.begin_request(&request);
        scope.get_or_create(ScopeType::Request, &bean).unwrap();
        panic!("handler failed");
    }));
    assert!(outcome.is_err());
    assert_eq!(recording.destroyed(), 1);
    assert!(!lifecycle.in_request());
}

#[test]
fn test_config_from_toml_drives_lifecycle() {
    let config = ContextConfig::from_toml_str(
        r#"
        parameter_name = "conv"
        lazy_conversation_context = true
        "#,
    )
    .unwrap();
    let mut lifecycle = ContextLifecycle::new(config);
    let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new().with_parameter("conv", "9"));

    let mut scope = lifecycle.begin_request(&request);
    assert!(scope.activation_error().is_none());
    assert!(scope.conversation().is_lazy());
    assert_eq!(scope.conversation().id(), None);
}

proptest! {
    #[test]
    fn prop_every_session_instance_destroyed_once(
        names in proptest::collection::btree_set("[a-z]{1,6}", 1..8),
        deferred in any::<bool>(),
    ) {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let session = MemorySession::new();
        let dying: Arc<dyn SessionHost> = session.clone();
        let beans: Vec<_> = names
            .iter()
            .map(|name| RecordingContextual::new(&format!("app.{name}")))
            .collect();

        {
            let mut scope = lifecycle.begin_request(&on_session(&session));
            for recording in &beans {
                let bean: Arc<dyn Contextual> = recording.clone();
                scope.get_or_create(ScopeType::Session, &bean).unwrap();
            }
            if deferred {
                session.invalidate();
                scope.session_destroyed(&dying);
            }
        }
        if !deferred {
            session.invalidate();
            lifecycle.session_destroyed(&dying);
        }
        lifecycle.session_destroyed(&dying);

        for recording in &beans {
            prop_assert_eq!(recording.destroyed(), 1);
        }
    }
}
