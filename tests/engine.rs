#![cfg(unix)]

mod common;

use std::{collections::BTreeMap, fs, time::Duration};

use pretty_assertions::assert_eq;
use serial_test::serial;
use tokio::sync::watch;
use vmware_desktop_utility::{
    engine::{CreateVirtualMachine, NetworkInterface, PowerOffMode, ToolsStatus},
    platform,
    status::Code,
    vmx::VmxMap,
};

use common::Fixture;

fn worker(fixture: &Fixture, name: &str) -> CreateVirtualMachine {
    let mut guest_infos = BTreeMap::new();
    guest_infos.insert("hostname".to_string(), name.to_string());
    CreateVirtualMachine {
        template: fixture.template_uuid(),
        name: name.to_string(),
        vcpus: 2,
        memory: 2048,
        disk_size_in_mb: 40960,
        guest_infos,
        networks: vec![NetworkInterface {
            connection_type: "custom".to_string(),
            vnet: "vmnet1".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
#[serial]
async fn test_create_worker_and_wait_for_tools() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();

    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();
    let expected_path = platform::vm_descriptor_path(&fixture.vm_folder, "worker-1");
    assert_eq!(vm.name, "worker-1");
    assert_eq!(vm.path, expected_path);
    assert_eq!(vm.vcpus, 2);
    assert_eq!(vm.memory, 2048);
    assert!(!vm.powered);

    let vmx = VmxMap::load(&expected_path).unwrap();
    assert_eq!(vmx.get("guestinfo.hostname"), Some("worker-1"));
    assert!(!vmx.has("guestinfo.metadata"));
    assert!(!vmx.has("instance-id"));
    assert_eq!(vmx.get("ethernet0.connectionType"), Some("custom"));
    assert!(vmx.get("ethernet0.vnet").unwrap().ends_with("vmnet1"));

    let clones = fixture.calls_to("clone");
    assert_eq!(clones.len(), 1);
    assert!(clones[0].ends_with("full -cloneName=worker-1"));
    let expansions = fixture.calls_to("vmware-vdiskmanager");
    assert_eq!(expansions.len(), 1);
    assert!(expansions[0].contains("-x 40960MB"));

    engine.power_on(&vm.uuid).await.unwrap();
    assert!(engine.power_state(&vm.uuid).await.unwrap());

    let started = std::time::Instant::now();
    let err = engine
        .wait_for_tools_running(&vm.uuid, Duration::from_secs(2), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() >= Duration::from_secs(2));

    fixture.set_tools_state("running");
    engine
        .wait_for_tools_running(&vm.uuid, Duration::from_secs(5), None)
        .await
        .unwrap();
    let vm = engine.virtual_machine_by_uuid(&vm.uuid).await.unwrap();
    assert_eq!(vm.tools_status, ToolsStatus::Running);
}

#[tokio::test]
#[serial]
async fn test_cache_indexes_agree() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();

    let created = engine.create(worker(&fixture, "worker-1")).await.unwrap();
    let by_uuid = engine.virtual_machine_by_uuid(&created.uuid).await.unwrap();
    let by_name = engine.virtual_machine_by_name("worker-1").await.unwrap();
    let by_path = engine.virtual_machine_by_path(&created.path).await.unwrap();
    assert_eq!(by_uuid, created);
    assert_eq!(by_name, created);
    assert_eq!(by_path, created);

    let names: Vec<String> = engine
        .list_virtual_machines()
        .await
        .unwrap()
        .into_iter()
        .map(|vm| vm.name)
        .collect();
    assert_eq!(names, vec!["base".to_string(), "worker-1".to_string()]);
}

#[tokio::test]
#[serial]
async fn test_duplicate_name_is_rejected() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();

    engine.create(worker(&fixture, "worker-1")).await.unwrap();
    let err = engine
        .create(worker(&fixture, "worker-1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
    assert_eq!(fixture.calls_to("clone").len(), 1);

    let mut missing = worker(&fixture, "worker-2");
    missing.template = "0000".to_string();
    let err = engine.create(missing).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
#[serial]
async fn test_power_guards() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();

    engine.power_on(&vm.uuid).await.unwrap();
    engine.power_on(&vm.uuid).await.unwrap();
    assert_eq!(fixture.calls_to("start").len(), 1);

    let err = engine.delete(&vm.uuid).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(vm.path.exists());

    engine.power_off(&vm.uuid, PowerOffMode::Hard).await.unwrap();
    assert!(fixture.calls_to("stop")[0].ends_with("hard"));
    assert!(!engine.power_state(&vm.uuid).await.unwrap());
    engine.shutdown_guest(&vm.uuid).await.unwrap();
    assert_eq!(fixture.calls_to("stop").len(), 1);

    engine.delete(&vm.uuid).await.unwrap();
    assert!(!vm.path.exists());
    let err = engine.virtual_machine_by_uuid(&vm.uuid).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
#[serial]
async fn test_stale_entry_is_evicted() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();

    fs::remove_dir_all(vm.path.parent().unwrap()).unwrap();

    let err = engine.virtual_machine_by_uuid(&vm.uuid).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    let vms = engine.list_virtual_machines().await.unwrap();
    assert!(vms.iter().all(|listed| listed.uuid != vm.uuid));
    assert_eq!(
        engine
            .virtual_machine_by_name("worker-1")
            .await
            .unwrap_err()
            .code(),
        Code::NotFound
    );
}

#[tokio::test]
#[serial]
async fn test_wait_for_ip_is_cancelled() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let uuid = fixture.template_uuid();
    engine.power_on(&uuid).await.unwrap();

    let (cancel, receiver) = watch::channel(false);
    let (result, _) = tokio::join!(
        engine.wait_for_ip(&uuid, Duration::ZERO, Some(receiver)),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.send_replace(true);
        }
    );
    assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    assert!(!fixture.calls_to("getGuestIPAddress").is_empty());
}

#[tokio::test]
#[serial]
async fn test_autostart_and_running_vms() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();

    engine.set_autostart(&vm.uuid, true).await.unwrap();
    assert!(VmxMap::load(&vm.path).unwrap().get_bool("autostart"));

    engine.start_autostart_vm().await.unwrap();
    let running = engine.running_vms().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].uuid, vm.uuid);
    assert!(running[0].powered);
}

#[tokio::test]
#[serial]
async fn test_network_interfaces_in_descriptor() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();

    engine
        .add_network_interface(
            &vm.uuid,
            NetworkInterface {
                connection_type: "custom".to_string(),
                vnet: "vmnet1".to_string(),
                mac_address: "00:50:56:3f:00:10".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine
        .change_network_interface(
            &vm.uuid,
            0,
            NetworkInterface {
                connection_type: "hostonly".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = engine.status(&vm.uuid).await.unwrap();
    assert!(!status.powered);
    assert_eq!(status.ethernet_cards.len(), 2);
    assert_eq!(status.ethernet_cards[0].connection_type, "hostonly");
    assert_eq!(status.ethernet_cards[1].connection_type, "custom");
    assert_eq!(status.ethernet_cards[1].mac_address, "00:50:56:3f:00:10");

    let err = engine
        .change_network_interface(&vm.uuid, 4, NetworkInterface::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
#[serial]
async fn test_cached_lookup_sees_out_of_band_power_on() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let uuid = fixture.template_uuid();

    let vm = engine.virtual_machine_by_uuid(&uuid).await.unwrap();
    assert!(!vm.powered);
    assert_eq!(vm.tools_status, ToolsStatus::NotRunning);

    fixture.start_out_of_band(&fixture.template);
    fixture.set_tools_state("running");

    let vm = engine.virtual_machine_by_uuid(&uuid).await.unwrap();
    assert!(vm.powered);
    assert_eq!(vm.tools_status, ToolsStatus::Running);
    assert!(engine.virtual_machine_by_name("base").await.unwrap().powered);
    assert!(engine.power_state(&uuid).await.unwrap());

    engine
        .wait_for_tools_running(&uuid, Duration::from_secs(2), None)
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn test_cached_lookup_fails_when_listing_fails() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let uuid = fixture.template_uuid();
    engine.virtual_machine_by_uuid(&uuid).await.unwrap();

    fixture.fail_listing(true);
    let err = engine.virtual_machine_by_uuid(&uuid).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.reason().contains("power state"));

    fixture.fail_listing(false);
    assert!(!engine.power_state(&uuid).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_network_interface_type_comes_from_vnet() {
    let fixture = Fixture::new();
    let driver = fixture.driver().await;
    let engine = driver.vmrun().unwrap();
    let vm = engine.create(worker(&fixture, "worker-1")).await.unwrap();
    let before = fs::read_to_string(&vm.path).unwrap();

    let err = engine
        .add_network_interface(
            &vm.uuid,
            NetworkInterface {
                vnet: "vmnet42".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(err.reason().contains("vmnet42"));
    let err = engine
        .add_network_interface(
            &vm.uuid,
            NetworkInterface {
                connection_type: "custom".to_string(),
                vnet: "vmnet42".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    let err = engine
        .add_network_interface(&vm.uuid, NetworkInterface::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(fs::read_to_string(&vm.path).unwrap(), before);

    engine
        .add_network_interface(
            &vm.uuid,
            NetworkInterface {
                vnet: "vmnet8".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine
        .change_network_interface(
            &vm.uuid,
            0,
            NetworkInterface {
                connection_type: "nat".to_string(),
                vnet: "vmnet1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let vmx = VmxMap::load(&vm.path).unwrap();
    assert_eq!(vmx.get("ethernet0.connectionType"), Some("hostonly"));
    assert_eq!(vmx.get("ethernet1.connectionType"), Some("nat"));
    for index in 0..2 {
        assert_ne!(
            vmx.get(&format!("ethernet{}.connectionType", index)),
            Some("")
        );
    }
}
