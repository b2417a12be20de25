mod common;

use std::time::Duration;

use common::*;
use pvecloud_common::{CloudError, CloudInstanceState};
use pvecloud_orchestrator::store::RecordStore;
use pvecloud_orchestrator::task_waiter::WaitPolicy;
use pvecloud_orchestrator::{CreateInstance, DeleteOutcome};

fn request(image_id: &str, flavour_id: &str) -> CreateInstance {
    CreateInstance {
        name: "web-1".into(),
        image_id: image_id.into(),
        flavour_id: flavour_id.into(),
        security_groups: vec!["web".into(), "ssh".into()],
        metadata: [("owner".to_string(), "alice".to_string())].into(),
        boot_command: "systemctl start app".into(),
    }
}

#[tokio::test]
async fn create_clones_configures_and_boots() {
    let h = harness().await;
    h.hv.set_next_id(101);

    let id = h.orch.create(request(TEMPLATE_ID, "small")).await.unwrap();
    assert_eq!(id, "101");

    let record = h.store.get_instance("101").await.unwrap().unwrap();
    assert_eq!(record.name, "web-1");
    assert_eq!(record.image_id, TEMPLATE_ID);
    assert!(record.metadata.contains("owner"));

    assert_eq!(h.hv.count_calls("clone"), 1);
    assert!(h.hv.calls().contains(&"clone 9000->101".to_string()));

    let config = h.hv.config_of("101").unwrap();
    assert_eq!(config.cores, 2);
    assert_eq!(config.memory, 2048);
    assert_eq!(config.agent, "enabled=1");
    assert_eq!(config.bootdisk, "scsi0");
    assert!(config.smbios1.starts_with("base64=1,serial="));

    let mut groups = h.hv.group_rules("101");
    groups.sort();
    assert_eq!(groups, vec!["ssh".to_string(), "web".to_string()]);

    // First boot and metadata registration run in the background.
    assert!(eventually(|| h.hv.count_calls("start") == 1).await);
    assert!(eventually(|| h.metadata.events() == vec!["register 101".to_string()]).await);
    let payload = &h.metadata.payloads()[0];
    assert!(payload.userdata.contains("instance-101"));
    assert!(payload.metadata.contains("visa"));

    assert!(
        eventually(|| h.hv.vm("101").map(|vm| vm.is_running()).unwrap_or(false)).await
    );
    assert_eq!(h.store.get_instance("101").await.unwrap().unwrap().start_count, 1);
}

#[tokio::test]
async fn create_with_unknown_image_persists_nothing() {
    let h = harness().await;
    let err = h.orch.create(request("4242", "small")).await.unwrap_err();
    assert!(matches!(err, CloudError::NotFound { kind: "image", .. }));
    assert!(h.store.get_instances().await.unwrap().is_empty());
    assert_eq!(h.hv.count_calls("next_id"), 0);
    assert_eq!(h.hv.count_calls("clone"), 0);
}

#[tokio::test]
async fn create_with_unknown_flavour_fails() {
    let h = harness().await;
    let err = h.orch.create(request(TEMPLATE_ID, "huge")).await.unwrap_err();
    assert!(matches!(err, CloudError::NotFound { kind: "flavour", .. }));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn create_without_capacity_fails_before_allocating() {
    let h = harness().await;
    h.hv.add_node("pve2", 2.0, 1.5, 64 * GIB, 0);
    h.store
        .create_flavour(&pvecloud_common::Flavour {
            id: "xl".into(),
            name: "XL".into(),
            cpus: 32,
            ram_mb: 2048,
            disk_gb: 20,
        })
        .await
        .unwrap();

    let err = h.orch.create(request(TEMPLATE_ID, "xl")).await.unwrap_err();
    assert!(matches!(err, CloudError::NoCapacity { cpus: 32, .. }));
    assert_eq!(h.hv.count_calls("next_id"), 0);
    assert!(h.store.get_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn clone_timeout_keeps_the_building_record() {
    let mut config = fast_config();
    config.clone_wait = WaitPolicy {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_millis(50),
    };
    let h = harness_with(config).await;
    h.hv.hang_tasks();

    let err = h.orch.create(request(TEMPLATE_ID, "small")).await.unwrap_err();
    assert!(matches!(err, CloudError::TaskTimeout { .. }));
    assert_eq!(h.status_of("100").await, Some(CloudInstanceState::Building));
    assert_eq!(h.hv.count_calls("configure"), 0);
    assert_eq!(h.hv.count_calls("start"), 0);
}

#[tokio::test]
async fn delete_discards_a_building_record_without_vm() {
    let h = harness().await;
    h.store
        .create_instance(&record("300", CloudInstanceState::Building, 0))
        .await
        .unwrap();

    let outcome = h.orch.delete("300").await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert!(h.store.get_instance("300").await.unwrap().is_none());
    assert_eq!(h.hv.count_calls("delete"), 0);
    assert!(eventually(|| h.metadata.events() == vec!["unregister 300".to_string()]).await);

    assert!(h.orch.delete("300").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn metadata_failure_does_not_abort_creation() {
    let h = harness().await;
    h.metadata.fail();
    let id = h.orch.create(request(TEMPLATE_ID, "small")).await.unwrap();
    assert!(h.hv.config_of(&id).is_some());
    assert!(eventually(|| h.metadata.events().len() == 1).await);
}

#[tokio::test]
async fn failed_group_attachment_does_not_abort_creation() {
    let h = harness().await;
    h.hv.fail_on("add_rule");
    let id = h.orch.create(request(TEMPLATE_ID, "small")).await.unwrap();
    assert!(h.hv.group_rules(&id).is_empty());
    assert!(eventually(|| h.hv.count_calls("start") == 1).await);
}

#[tokio::test]
async fn background_work_is_cancelled_on_shutdown() {
    let mut config = fast_config();
    config.clone_wait = WaitPolicy {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(60),
    };
    let h = harness_with(config).await;
    h.hv.hang_tasks();

    let orch = h.orch.clone();
    let pending = tokio::spawn(async move { orch.create(request(TEMPLATE_ID, "small")).await });
    assert!(eventually(|| h.hv.count_calls("list_tasks") > 0).await);

    h.orch.shutdown_background();
    let res = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("clone wait did not observe cancellation")
        .unwrap();
    assert!(matches!(res, Err(CloudError::Cancelled)));
}

#[tokio::test]
async fn start_budget_is_enforced_without_remote_call() {
    let h = harness().await;
    h.existing(101, "stopped", CloudInstanceState::Stopped, 0).await;
    h.hv.fail_on("start");

    for _ in 0..MAX_START_RETRY {
        let err = h.orch.start("101").await.unwrap_err();
        assert!(matches!(err, CloudError::RemoteStatus { status: 500, .. }));
    }
    assert_eq!(h.hv.count_calls("start"), MAX_START_RETRY as usize);

    let err = h.orch.start("101").await.unwrap_err();
    assert!(matches!(err, CloudError::StartRetryExceeded { max: MAX_START_RETRY, .. }));
    assert_eq!(h.hv.count_calls("start"), MAX_START_RETRY as usize);

    // Only an explicit reset gives the budget back.
    h.hv.recover("start");
    h.orch.reset_start_count("101").await.unwrap();
    h.orch.start("101").await.unwrap();
    assert_eq!(h.hv.count_calls("start"), MAX_START_RETRY as usize + 1);
}

#[tokio::test]
async fn concurrent_starts_share_one_budget() {
    let h = harness().await;
    h.existing(101, "stopped", CloudInstanceState::Stopped, 0).await;

    let attempts: Vec<_> = (0..10)
        .map(|_| {
            let orch = h.orch.clone();
            tokio::spawn(async move { orch.start("101").await })
        })
        .collect();
    let mut ok = 0;
    let mut exceeded = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => ok += 1,
            Err(CloudError::StartRetryExceeded { .. }) => exceeded += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(ok, MAX_START_RETRY);
    assert_eq!(exceeded, 10 - MAX_START_RETRY);
    assert_eq!(h.hv.count_calls("start"), MAX_START_RETRY as usize);
}

#[tokio::test]
async fn start_of_unknown_instance_is_not_found() {
    let h = harness().await;
    let err = h.orch.start("555").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.hv.count_calls("start"), 0);
}

#[tokio::test]
async fn shutdown_and_stop_mark_stopping() {
    let h = harness().await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;
    h.existing(102, "running", CloudInstanceState::Active, 1).await;

    h.orch.shutdown("101").await.unwrap();
    h.orch.stop("102").await.unwrap();

    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Stopping));
    assert_eq!(h.status_of("102").await, Some(CloudInstanceState::Stopping));
    assert_eq!(h.hv.count_calls("shutdown"), 1);
    assert_eq!(h.hv.count_calls("stop"), 1);
}

#[tokio::test]
async fn reboot_restores_active_when_the_task_completes() {
    let h = harness().await;
    h.hv.set_task_polls(3);
    h.existing(101, "running", CloudInstanceState::Active, 1).await;

    let callback = h.orch.reboot("101").await.unwrap();
    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Rebooting));

    callback.await.unwrap();
    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Active));
    let updates: Vec<_> = h.store.status_updates().into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        updates,
        vec![CloudInstanceState::Rebooting, CloudInstanceState::Active]
    );
}

#[tokio::test]
async fn reboot_callback_survives_poll_errors() {
    let h = harness().await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;
    h.hv.fail_on("list_tasks");

    let callback = h.orch.reboot("101").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Rebooting));

    h.hv.recover("list_tasks");
    callback.await.unwrap();
    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Active));
}

#[tokio::test]
async fn reboot_that_never_completes_stays_rebooting() {
    let mut config = fast_config();
    config.task_wait = WaitPolicy {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_millis(40),
    };
    let h = harness_with(config).await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;
    h.hv.hang_tasks();

    let callback = h.orch.reboot("101").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), callback)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.status_of("101").await, Some(CloudInstanceState::Rebooting));
    assert_eq!(h.store.status_updates_for("101"), 1);
}

#[tokio::test]
async fn delete_of_running_instance_only_stops_it() {
    let h = harness().await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;

    let outcome = h.orch.delete("101").await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Stopping);
    assert_eq!(h.hv.count_calls("stop"), 1);
    assert_eq!(h.hv.count_calls("delete"), 0);
    assert!(h.store.get_instance("101").await.unwrap().is_some());
    assert!(h.metadata.events().is_empty());

    // Once stopped, a second delete completes.
    let outcome = h.orch.delete("101").await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
}

#[tokio::test]
async fn delete_of_stopped_instance_removes_everything() {
    let h = harness().await;
    h.existing(101, "stopped", CloudInstanceState::Stopped, 1).await;

    let outcome = h.orch.delete("101").await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert!(h.hv.vm("101").is_none());
    assert!(h.store.get_instance("101").await.unwrap().is_none());
    assert!(eventually(|| h.metadata.events() == vec!["unregister 101".to_string()]).await);
}

#[tokio::test]
async fn security_groups_are_added_and_removed_by_name() {
    let h = harness().await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;
    h.hv.add_group_rule("101", "ssh");

    h.orch.add_security_group("101", "web").await.unwrap();
    assert_eq!(
        h.orch.instance_security_groups("101").await.unwrap(),
        vec!["ssh".to_string(), "web".to_string()]
    );

    h.orch.remove_security_group("101", "ssh").await.unwrap();
    assert_eq!(h.hv.group_rules("101"), vec!["web".to_string()]);

    let err = h.orch.remove_security_group("101", "db").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn mutations_on_a_vanished_vm_remove_the_record() {
    let h = harness().await;
    h.existing(101, "running", CloudInstanceState::Active, 1).await;
    h.hv.remove_vm("101");

    let err = h.orch.stop("101").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.store.get_instance("101").await.unwrap().is_none());
    assert_eq!(h.hv.count_calls("stop"), 0);
}

#[tokio::test]
async fn catalog_reads() {
    let h = harness().await;
    h.hv.add_cluster_group("web");
    h.existing(101, "running", CloudInstanceState::Active, 1).await;

    let images = h.orch.images().await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].id, TEMPLATE_ID);
    assert_eq!(images[0].name, "debian-12");
    assert!(h.orch.image("101").await.unwrap_err().is_not_found());

    assert_eq!(h.orch.flavours().await.unwrap().len(), 1);
    assert_eq!(h.orch.security_groups().await.unwrap(), vec!["web".to_string()]);
    assert_eq!(h.orch.instance_identifiers().await.unwrap(), vec!["101".to_string()]);

    let metrics = h.orch.metrics().await.unwrap();
    assert_eq!(metrics.max_total_cores, 16);
    assert_eq!(metrics.max_total_ram_mb, 64 * 1024);
    assert_eq!(metrics.total_instances_used, 1);
}

#[tokio::test]
async fn flavour_administration() {
    let h = harness().await;
    let bad = pvecloud_common::Flavour {
        id: "zero".into(),
        name: "Zero".into(),
        cpus: 0,
        ram_mb: 512,
        disk_gb: 1,
    };
    assert!(matches!(
        h.orch.create_flavour(bad).await,
        Err(CloudError::Invalid(_))
    ));

    let medium = pvecloud_common::Flavour {
        id: "medium".into(),
        name: "Medium".into(),
        cpus: 4,
        ram_mb: 8192,
        disk_gb: 40,
    };
    h.orch.create_flavour(medium.clone()).await.unwrap();
    assert_eq!(h.orch.flavour("medium").await.unwrap(), medium);

    h.orch.delete_flavour("medium").await.unwrap();
    assert!(h.orch.delete_flavour("medium").await.unwrap_err().is_not_found());
}
