//! Integration tests for image and instance lifecycles over a real store and
//! a recording executor.

mod common;

use clonedb_core::{ImageId, Instance, InstanceId, Principal};
use clonedb_exec::{ExecError, Executor};
use clonedb_metadata::models::InstanceRow;
use clonedb_server::LifecycleError;
use common::{Call, Op, RecordingExecutor, TestLifecycle, anonymisation_script, backed_up_at};
use std::collections::HashSet;
use std::time::Duration;
use time::OffsetDateTime;

async fn ready_image(t: &TestLifecycle) -> ImageId {
    let image = t
        .lifecycle
        .create_image(backed_up_at(), anonymisation_script())
        .await
        .unwrap();
    t.lifecycle.finalise_image(image.id).await.unwrap();
    image.id
}

#[tokio::test]
async fn test_full_scenario() {
    let t = TestLifecycle::new().await;
    let upload = Principal::upload("upload");
    let user = Principal::ordinary("user@example.com");

    let image = t
        .lifecycle
        .create_image(backed_up_at(), anonymisation_script())
        .await
        .unwrap();
    assert!(!image.ready);
    assert_eq!(image.backed_up_at, backed_up_at());
    assert!(t.executor.has_upload(image.id));

    let image = t.lifecycle.finalise_image(image.id).await.unwrap();
    assert!(image.ready);
    assert!(t.executor.has_image(image.id));

    let first = t.lifecycle.create_instance(image.id).await.unwrap();
    let second = t.lifecycle.create_instance(image.id).await.unwrap();
    assert_ne!(first.port, second.port);
    assert_eq!(first.image_id, image.id);

    let err = t
        .lifecycle
        .destroy_image_as(&user, image.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::HasInstances { count: 2, .. }
    ));
    assert_eq!(t.lifecycle.list_instances().await.unwrap().len(), 2);

    t.lifecycle.destroy_image_as(&upload, image.id).await.unwrap();
    assert!(t.lifecycle.list_instances().await.unwrap().is_empty());
    assert!(t.lifecycle.list_images().await.unwrap().is_empty());
    assert!(!t.executor.has_image(image.id));
    assert_eq!(t.executor.instance_count(), 0);
}

#[tokio::test]
async fn test_create_image_executor_failure_keeps_record() {
    let t = TestLifecycle::new().await;
    t.executor.fail(Op::CreateSubvolume);

    let err = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Exec(_)));
    assert!(err.is_internal());

    let images = t.lifecycle.list_images().await.unwrap();
    assert_eq!(images.len(), 1);
    assert!(!images[0].ready);
}

#[tokio::test]
async fn test_get_missing_image_and_instance() {
    let t = TestLifecycle::new().await;

    assert!(matches!(
        t.lifecycle.get_image(ImageId::new(999)).await,
        Err(LifecycleError::ImageNotFound(id)) if id == ImageId::new(999)
    ));
    assert!(matches!(
        t.lifecycle.get_instance(InstanceId::new(999)).await,
        Err(LifecycleError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_finalise_passes_script_and_is_not_repeated() {
    let t = TestLifecycle::new().await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), anonymisation_script())
        .await
        .unwrap();

    t.lifecycle.finalise_image(image.id).await.unwrap();
    let err = t.lifecycle.finalise_image(image.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyReady(_)));

    assert_eq!(t.executor.count(Op::FinaliseImage), 1);
    assert!(
        t.executor
            .calls()
            .contains(&Call::FinaliseImage(image.id, anonymisation_script()))
    );
}

#[tokio::test]
async fn test_finalise_missing_image() {
    let t = TestLifecycle::new().await;
    let err = t
        .lifecycle
        .finalise_image(ImageId::new(999))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ImageNotFound(_)));
    assert_eq!(t.executor.count(Op::FinaliseImage), 0);
}

#[tokio::test]
async fn test_finalise_failure_is_retryable() {
    let t = TestLifecycle::new().await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap();

    t.executor.fail(Op::FinaliseImage);
    let err = t.lifecycle.finalise_image(image.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Exec(ExecError::CommandFailed { .. })));
    assert!(!t.lifecycle.get_image(image.id).await.unwrap().ready);

    t.executor.clear_failures();
    let image = t.lifecycle.finalise_image(image.id).await.unwrap();
    assert!(image.ready);
}

#[tokio::test]
async fn test_ready_is_monotone() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;

    // Nothing that can fail afterwards may flip it back.
    t.executor.fail(Op::FinaliseImage);
    let _ = t.lifecycle.finalise_image(image_id).await;
    t.executor.fail(Op::DestroySubvolume);
    let _ = t.lifecycle.destroy_image(image_id).await;

    assert!(t.lifecycle.get_image(image_id).await.unwrap().ready);
}

#[tokio::test]
async fn test_create_instance_requires_ready_image() {
    let t = TestLifecycle::new().await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap();

    let err = t.lifecycle.create_instance(image.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::ImageNotReady(_)));
    assert_eq!(t.executor.count(Op::CreateInstance), 0);

    t.lifecycle.finalise_image(image.id).await.unwrap();
    let instance = t.lifecycle.create_instance(image.id).await.unwrap();
    let stored = t.lifecycle.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.port, instance.port);
    assert_eq!(stored.image_id, image.id);
}

#[tokio::test]
async fn test_create_instance_missing_image() {
    let t = TestLifecycle::new().await;
    let err = t
        .lifecycle
        .create_instance(ImageId::new(999))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ImageNotFound(_)));
    assert!(t.executor.calls().is_empty());
}

#[tokio::test]
async fn test_create_instance_executor_failure_leaves_no_record() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;

    t.executor.fail(Op::CreateInstance);
    let err = t.lifecycle.create_instance(image_id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Exec(_)));
    assert!(t.lifecycle.list_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(5)),
    )
    .await;
    let image_id = ready_image(&t).await;

    let creates = (0..8).map(|_| {
        let lifecycle = t.lifecycle.clone();
        async move { lifecycle.create_instance(image_id).await }
    });
    let instances: Vec<Instance> = futures::future::join_all(creates)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let ports: HashSet<u16> = instances.iter().map(|i| i.port).collect();
    assert_eq!(ports.len(), instances.len());
    let ids: HashSet<InstanceId> = instances.iter().map(|i| i.id).collect();
    assert_eq!(ids.len(), instances.len());
}

#[tokio::test]
async fn test_store_failure_after_create_destroys_instance() {
    let t = TestLifecycle::with_executor(RecordingExecutor::new().with_fixed_port(42500)).await;
    let image_id = ready_image(&t).await;

    // Occupy the port the executor will hand out so the record insert fails.
    let store = t.store();
    let squatter_id = store.reserve_instance_id().await.unwrap();
    let now = OffsetDateTime::now_utc();
    store
        .create_instance(&InstanceRow::new(&Instance {
            id: InstanceId::new(squatter_id),
            image_id,
            port: 42500,
            created_at: now,
            updated_at: now,
        }))
        .await
        .unwrap();

    let err = t.lifecycle.create_instance(image_id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Metadata(_)));
    assert!(err.is_internal());

    let created = t
        .executor
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::CreateInstance(_, id) => Some(id),
            _ => None,
        })
        .unwrap();
    assert!(t.executor.calls().contains(&Call::DestroyInstance(created)));
    assert!(!t.executor.has_instance(created));
    assert_eq!(t.lifecycle.list_instances().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_destroy_instance() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();

    t.lifecycle.destroy_instance(instance.id).await.unwrap();
    assert!(!t.executor.has_instance(instance.id));
    assert!(matches!(
        t.lifecycle.get_instance(instance.id).await,
        Err(LifecycleError::InstanceNotFound(_))
    ));
    assert!(t.executor.reserved_ports().await.is_empty());

    let err = t.lifecycle.destroy_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InstanceNotFound(_)));
}

#[tokio::test]
async fn test_destroy_instance_failure_keeps_record() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();

    t.executor.fail_instance(instance.id);
    let err = t.lifecycle.destroy_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Exec(_)));
    assert!(t.lifecycle.get_instance(instance.id).await.is_ok());

    t.executor.clear_failures();
    t.lifecycle.destroy_instance(instance.id).await.unwrap();
}

#[tokio::test]
async fn test_destroy_instance_absent_on_host_removes_record() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();

    // Host side disappears behind our back.
    t.executor.destroy_instance(instance.id).await.unwrap();

    t.lifecycle.destroy_instance(instance.id).await.unwrap();
    assert!(t.lifecycle.list_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ordinary_destroy_with_and_without_dependents() {
    let t = TestLifecycle::new().await;
    let user = Principal::ordinary("user@example.com");
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();

    let err = t
        .lifecycle
        .destroy_image_as(&user, image_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::HasInstances { count: 1, .. }
    ));
    assert_eq!(t.executor.count(Op::DestroySubvolume), 0);
    assert_eq!(t.executor.count(Op::DestroyInstance), 0);

    t.lifecycle.destroy_instance(instance.id).await.unwrap();
    t.lifecycle.destroy_image_as(&user, image_id).await.unwrap();
    assert!(matches!(
        t.lifecycle.get_image(image_id).await,
        Err(LifecycleError::ImageNotFound(_))
    ));
}

#[tokio::test]
async fn test_destroy_image_executor_failure_keeps_record() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;

    t.executor.fail(Op::DestroySubvolume);
    let err = t.lifecycle.destroy_image(image_id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Exec(_)));
    assert!(t.lifecycle.get_image(image_id).await.is_ok());
}

#[tokio::test]
async fn test_destroy_unfinalised_image() {
    let t = TestLifecycle::new().await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap();

    t.lifecycle.destroy_image(image.id).await.unwrap();
    assert!(!t.executor.has_upload(image.id));
    assert!(t.lifecycle.list_images().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cascade_destroys_every_dependent_in_order() {
    let t = TestLifecycle::new().await;
    let upload = Principal::upload("upload");
    let image_id = ready_image(&t).await;
    let other_image = ready_image(&t).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(t.lifecycle.create_instance(image_id).await.unwrap().id);
    }
    let bystander = t.lifecycle.create_instance(other_image).await.unwrap();

    t.lifecycle.destroy_image_as(&upload, image_id).await.unwrap();

    let destroyed: Vec<InstanceId> = t
        .executor
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::DestroyInstance(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(destroyed, ids);

    let remaining: Vec<InstanceId> = t
        .lifecycle
        .list_instances()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(remaining, vec![bystander.id]);
    assert!(matches!(
        t.lifecycle.get_image(image_id).await,
        Err(LifecycleError::ImageNotFound(_))
    ));
}

#[tokio::test]
async fn test_cascade_without_dependents() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;

    t.lifecycle.cascade_destroy_image(image_id).await.unwrap();
    assert!(t.lifecycle.list_images().await.unwrap().is_empty());
    assert_eq!(t.executor.count(Op::DestroyInstance), 0);
}

#[tokio::test]
async fn test_cascade_missing_image() {
    let t = TestLifecycle::new().await;
    let err = t
        .lifecycle
        .cascade_destroy_image(ImageId::new(999))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ImageNotFound(_)));
}

#[tokio::test]
async fn test_cascade_aborts_and_resumes() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(t.lifecycle.create_instance(image_id).await.unwrap().id);
    }
    t.executor.fail_instance(ids[1]);

    let err = t
        .lifecycle
        .cascade_destroy_image(image_id)
        .await
        .unwrap_err();
    match &err {
        LifecycleError::CascadeFailed { instance_id, .. } => assert_eq!(*instance_id, ids[1]),
        other => panic!("expected CascadeFailed, got {other:?}"),
    }
    assert!(err.is_internal());

    // First instance gone; the failing one, the rest and the image remain.
    let remaining: Vec<InstanceId> = t
        .lifecycle
        .list_instances()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(remaining, vec![ids[1], ids[2]]);
    assert!(t.lifecycle.get_image(image_id).await.is_ok());
    assert_eq!(t.executor.count(Op::DestroySubvolume), 0);

    t.executor.clear_failures();
    t.lifecycle.cascade_destroy_image(image_id).await.unwrap();
    assert!(t.lifecycle.list_instances().await.unwrap().is_empty());
    assert!(t.lifecycle.list_images().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cascade_tolerates_instances_missing_on_host() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();

    t.executor.destroy_instance(instance.id).await.unwrap();

    t.lifecycle.cascade_destroy_image(image_id).await.unwrap();
    assert!(t.lifecycle.list_images().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_operations_never_overlap_per_id() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(10)),
    )
    .await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap();

    let finalises = (0..4).map(|_| {
        let lifecycle = t.lifecycle.clone();
        async move { lifecycle.finalise_image(image.id).await }
    });
    let results = futures::future::join_all(finalises).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LifecycleError::AlreadyReady(_)))
    );
    assert_eq!(t.executor.count(Op::FinaliseImage), 1);
    assert_eq!(t.executor.overlaps(), 0);

    let instance = t.lifecycle.create_instance(image.id).await.unwrap();
    let destroys = (0..3).map(|_| {
        let lifecycle = t.lifecycle.clone();
        async move { lifecycle.destroy_instance(instance.id).await }
    });
    let results = futures::future::join_all(destroys).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(t.executor.overlaps(), 0);
}

/// Wait until an image record created on another task becomes visible.
async fn first_image_id(t: &TestLifecycle) -> ImageId {
    for _ in 0..100 {
        if let Some(image) = t.lifecycle.list_images().await.unwrap().first() {
            return image.id;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("image record never appeared");
}

#[tokio::test]
async fn test_destroy_image_waits_for_inflight_image_create() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(100)),
    )
    .await;

    let creator = {
        let lifecycle = t.lifecycle.clone();
        tokio::spawn(async move { lifecycle.create_image(backed_up_at(), Vec::new()).await })
    };
    let image_id = first_image_id(&t).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    t.lifecycle.destroy_image(image_id).await.unwrap();
    let created = creator.await.unwrap().unwrap();
    assert_eq!(created.id, image_id);

    assert_eq!(t.executor.overlaps(), 0);
    let ops: Vec<Op> = t.executor.calls().iter().map(Call::op).collect();
    assert_eq!(ops, vec![Op::CreateSubvolume, Op::DestroySubvolume]);
    assert!(!t.executor.has_upload(image_id));
    assert!(matches!(
        t.lifecycle.get_image(image_id).await.unwrap_err(),
        LifecycleError::ImageNotFound(_)
    ));
}

#[tokio::test]
async fn test_finalise_waits_for_inflight_image_create() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(50)),
    )
    .await;

    let creator = {
        let lifecycle = t.lifecycle.clone();
        tokio::spawn(async move {
            lifecycle
                .create_image(backed_up_at(), anonymisation_script())
                .await
        })
    };
    let image_id = first_image_id(&t).await;

    let image = t.lifecycle.finalise_image(image_id).await.unwrap();
    assert!(image.ready);
    assert!(creator.await.unwrap().is_ok());

    assert_eq!(t.executor.overlaps(), 0);
    let ops: Vec<Op> = t.executor.calls().iter().map(Call::op).collect();
    assert_eq!(ops, vec![Op::CreateSubvolume, Op::FinaliseImage]);
    assert!(t.executor.has_image(image_id));
}

#[tokio::test]
async fn test_destroy_waits_for_inflight_create() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(20)),
    )
    .await;
    let image_id = ready_image(&t).await;

    let creator = {
        let lifecycle = t.lifecycle.clone();
        tokio::spawn(async move { lifecycle.create_instance(image_id).await })
    };
    // Let the create take the image lock first.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = t.lifecycle.destroy_image(image_id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::HasInstances { .. }));
    assert!(creator.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_dropped_caller_does_not_cancel_operation() {
    let t = TestLifecycle::with_executor(
        RecordingExecutor::new().with_delay(Duration::from_millis(50)),
    )
    .await;
    let image = t
        .lifecycle
        .create_image(backed_up_at(), Vec::new())
        .await
        .unwrap();

    // Abandon the finalise part way through the executor call.
    let _ = tokio::time::timeout(
        Duration::from_millis(10),
        t.lifecycle.finalise_image(image.id),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(t.lifecycle.get_image(image.id).await.unwrap().ready);
}

#[tokio::test]
async fn test_locks_are_released() {
    let t = TestLifecycle::new().await;
    let image_id = ready_image(&t).await;
    let instance = t.lifecycle.create_instance(image_id).await.unwrap();
    t.lifecycle.destroy_instance(instance.id).await.unwrap();
    t.lifecycle.destroy_image(image_id).await.unwrap();

    // No guards are held once every operation returned.
    let _image = tokio::time::timeout(
        Duration::from_millis(50),
        t.lifecycle.locks().image_write(image_id),
    )
    .await
    .unwrap();
    let _instance = tokio::time::timeout(
        Duration::from_millis(50),
        t.lifecycle.locks().instance_write(instance.id),
    )
    .await
    .unwrap();
}
