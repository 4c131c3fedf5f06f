use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing_test::traced_test;

use super::*;
use crate::proto::error::ErrorCode;
use crate::test_utils::run_in_task;
use crate::test_utils::test_key;
use crate::test_utils::test_router_manager;
use crate::test_utils::test_runtime_with;
use crate::test_utils::test_settings;
use crate::test_utils::RouterScript;
use crate::test_utils::TestRouterObject;
use crate::test_utils::TestRuntime;
use crate::test_utils::TEST_ROUTER_TYPE;
use crate::AwaitableContext;
use crate::RpcResult;

struct Fixture {
    rt: TestRuntime,
    set: Arc<RouterManagerSet>,
    manager: Arc<RouterManager<TestRouterObject>>,
    script: Arc<RouterScript>,
}

fn fixture() -> Fixture {
    let mut settings = test_settings();
    settings.router.retry_max_ttl = 5;
    settings.router.cache_retry_interval = 1;
    settings.router.object_retry_interval = 1;
    let rt = test_runtime_with(settings);
    let set = RouterManagerSet::new(rt.app.clone());
    let script = RouterScript::new();
    let manager = test_router_manager(&set, script.clone());
    Fixture {
        rt,
        set,
        manager,
        script,
    }
}

#[tokio::test]
#[traced_test]
async fn test_mutable_object_retries_eagain() {
    let f = fixture();
    f.script
        .push_pull_results([ErrorCode::RouterEagain, ErrorCode::RouterEagain]);

    let manager = f.manager.clone();
    let object = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap();

    assert_eq!(f.script.pulls(), 3);
    assert!(object.base().is_writable());
    let cached = f.manager.get_object(&test_key(1)).unwrap();
    assert!(Arc::ptr_eq(&cached, &object));
    assert!(logs_contain("pull object failed"));
}

#[tokio::test]
async fn test_mutable_object_gives_up_after_ttl() {
    let f = fixture();
    f.script.push_pull_results([ErrorCode::RouterEagain; 6]);

    let manager = f.manager.clone();
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap_err();

    assert!(err.is(ErrorCode::RouterTtlExtend));
    assert_eq!(f.script.pulls(), 5);
    assert!(f.manager.get_cache(&test_key(1)).is_none());
}

#[tokio::test]
async fn test_terminal_codes_abort_without_retry() {
    let f = fixture();
    f.script.push_pull_results([ErrorCode::DbRecordNotFound]);

    let manager = f.manager.clone();
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap_err();
    assert!(err.is(ErrorCode::DbRecordNotFound));
    assert_eq!(f.script.pulls(), 1);

    f.script.push_pull_results([ErrorCode::RouterNotFound]);
    let manager = f.manager.clone();
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_cache(&ctx, test_key(2), &()).await
    })
    .await
    .unwrap_err();
    assert!(err.is(ErrorCode::RouterNotFound));
    assert_eq!(f.script.pull_cache_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_not_writable_is_terminal_for_objects_only() {
    let f = fixture();
    f.script.owner.store(f.rt.app.logic_id() + 1, Ordering::SeqCst);

    let manager = f.manager.clone();
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap_err();
    assert!(err.is(ErrorCode::RouterNotWritable));
    assert_eq!(f.script.pulls(), 1);

    f.script
        .push_pull_results([ErrorCode::RouterNotWritable, ErrorCode::Success]);
    let manager = f.manager.clone();
    let cache = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_cache(&ctx, test_key(2), &()).await
    })
    .await
    .unwrap();
    assert_eq!(f.script.pull_cache_count.load(Ordering::SeqCst), 2);
    assert!(!cache.base().is_writable());
}

#[tokio::test]
async fn test_mutable_cache_hit_skips_pull() {
    let f = fixture();
    let manager = f.manager.clone();
    run_in_task(&f.rt.app, move |ctx| async move {
        let first = manager.mutable_cache(&ctx, test_key(1), &()).await?;
        first.base().set_flag(RouterObjectFlag::SCHED_REMOVE_CACHE);
        let second = manager.mutable_cache(&ctx, test_key(1), &()).await?;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.base().check_flag(RouterObjectFlag::SCHED_REMOVE_CACHE));
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(f.script.pull_cache_count.load(Ordering::SeqCst), 1);
    assert_eq!(f.manager.size(), 1);
    assert!(f.manager.get_object(&test_key(1)).is_none());
}

#[tokio::test]
async fn test_new_cache_gets_default_timer() {
    let f = fixture();
    let manager = f.manager.clone();
    let cache = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_cache(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap();

    assert_eq!(cache.base().timer_list(), Some(TimerListKind::Default));
    assert_eq!(f.set.timer_count(TimerListKind::Default), 1);
}

#[tokio::test]
async fn test_closing_manager_refuses_objects() {
    let f = fixture();
    f.manager.on_stop();
    assert!(f.manager.is_closing());

    let manager = f.manager.clone();
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await
    })
    .await
    .unwrap_err();
    assert!(err.is(ErrorCode::RouterClosing));
    assert_eq!(f.script.pulls(), 0);
}

#[tokio::test]
async fn test_remove_cache_is_identity_checked() {
    let f = fixture();
    let manager = f.manager.clone();
    let stale = Arc::new(TestRouterObject::new(test_key(1), 0, f.script.clone()));
    run_in_task(&f.rt.app, move |ctx| async move {
        let current = manager.mutable_cache(&ctx, test_key(1), &()).await?;

        let err = manager
            .remove_cache(&ctx, test_key(1), Some(&stale), &())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::RouterNotFound));
        assert!(manager.get_cache(&test_key(1)).is_some());

        manager.remove_cache(&ctx, test_key(1), Some(&current), &()).await?;
        assert!(manager.get_cache(&test_key(1)).is_none());
        assert!(current.base().check_flag(RouterObjectFlag::CACHE_REMOVED));
        assert_eq!(current.base().timer_list(), None);

        let err = manager.remove_cache(&ctx, test_key(1), None, &()).await.unwrap_err();
        assert!(err.is(ErrorCode::RouterNotFound));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_remove_cache_of_writable_object_saves_first() {
    let f = fixture();
    let manager = f.manager.clone();
    let removed = Arc::new(AtomicUsize::new(0));
    let counter = removed.clone();
    f.manager.set_on_object_removed(Arc::new(move |_: &AwaitableContext, _: RouterKey, _: &Arc<TestRouterObject>, _: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let object = run_in_task(&f.rt.app, move |ctx| async move {
        let object = manager.mutable_object(&ctx, test_key(1), &()).await?;
        manager.remove_cache(&ctx, test_key(1), None, &()).await?;
        Ok(object)
    })
    .await
    .unwrap();

    assert_eq!(f.script.saves(), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(!object.base().check_flag(RouterObjectFlag::IS_OBJECT));
    assert!(!object.base().check_flag(RouterObjectFlag::REMOVING_OBJECT));
    assert!(!object.base().check_flag(RouterObjectFlag::REMOVING_CACHE));
    assert_eq!(f.manager.size(), 0);
}

#[tokio::test]
async fn test_renew_cache_replaces_removed_instance() {
    let f = fixture();
    let manager = f.manager.clone();
    run_in_task(&f.rt.app, move |ctx| async move {
        let first = manager.mutable_cache(&ctx, test_key(1), &()).await?;
        let same = manager
            .renew_cache(&ctx, test_key(1), Some(first.clone()), &())
            .await?;
        assert!(Arc::ptr_eq(&first, &same));

        manager.remove_cache(&ctx, test_key(1), Some(&first), &()).await?;
        let renewed = manager
            .renew_cache(&ctx, test_key(1), Some(first.clone()), &())
            .await?;
        assert!(!Arc::ptr_eq(&first, &renewed));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_pull_hooks_fire_once_per_pull() {
    let f = fixture();
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = pulls.clone();
    f.manager.set_on_pull_object(Arc::new(move |_: &AwaitableContext, object: &Arc<TestRouterObject>, _: &()| {
        assert!(object.base().is_writable());
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let manager = f.manager.clone();
    run_in_task(&f.rt.app, move |ctx| async move {
        manager.mutable_object(&ctx, test_key(1), &()).await?;
        manager.mutable_object(&ctx, test_key(1), &()).await?;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(pulls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remove_of_foreign_object_is_rejected() {
    struct Other {
        base: RouterObjectBase,
    }

    #[async_trait::async_trait]
    impl RouterObject for Other {
        type PrivateData = ();

        fn base(&self) -> &RouterObjectBase {
            &self.base
        }

        async fn pull_object(
            &self,
            _ctx: &AwaitableContext,
            _private_data: &(),
        ) -> RpcResult<()> {
            Ok(())
        }

        async fn save_object(
            &self,
            _ctx: &AwaitableContext,
            _private_data: &(),
        ) -> RpcResult<()> {
            Ok(())
        }
    }

    let f = fixture();
    let manager = f.set.manager(TEST_ROUTER_TYPE).unwrap();
    let other: Arc<dyn ManagedObject> = Arc::new(Other {
        base: RouterObjectBase::new(test_key(1), 0),
    });
    let err = run_in_task(&f.rt.app, move |ctx| async move {
        manager.remove_object_of(&ctx, other).await
    })
    .await
    .unwrap_err();
    assert!(err.is(ErrorCode::System));
}
