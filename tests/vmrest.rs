#![cfg(unix)]

mod common;

use std::{fs, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use serial_test::serial;
use vmrest_models::models::VmId;
use vmware_desktop_utility::{
    builder::Configuration,
    driver::{
        advanced::AdvancedDriver, portfwd::PORTFWD_PREFIX, vmrest::VmrestDriver,
        vmrest::MANAGED_DESCRIPTION, Backend, BaseDriver, Driver, Networking, PortFwd, Vmnet,
    },
    engine::{CreateVirtualMachine, Mode},
    lifecycle::Lifecycle,
    platform,
    settings::{NatStore, NAT_SETTINGS_FILE},
    status::Code,
    vmrest::{RestClient, Vmrest, VmrestConfig},
};

use common::{daemon::FakeDaemon, Fixture};

const TEMPLATE_ID: &str = "TEMPLATE";

async fn daemon(fixture: &Fixture) -> FakeDaemon {
    let template = VmId::new(
        TEMPLATE_ID.to_string(),
        fixture.template.display().to_string(),
    );
    FakeDaemon::start(&fixture.vm_folder, vec![template]).await
}

fn auto(fixture: &Fixture, daemon: &FakeDaemon) -> Configuration {
    fixture
        .config("")
        .with_vmrest_url(daemon.url.clone())
        .with_timeout(Duration::from_secs(5))
}

fn ssh_forward(description: String) -> PortFwd {
    PortFwd {
        port: 2222,
        protocol: "tcp".to_string(),
        description,
        slot_number: 0,
        guest_ip: "172.16.10.5".to_string(),
        guest_port: 22,
    }
}

async fn client(daemon: &FakeDaemon) -> Arc<RestClient> {
    let config = VmrestConfig::new("/nonexistent/vmrest".into(), "/nonexistent/cfg".into())
        .with_external_url(Some(daemon.url.clone()));
    let vmrest = Vmrest::start(&Lifecycle::new(), config).await.unwrap();
    Arc::new(RestClient::new(Arc::new(vmrest)).with_timeout(Duration::from_secs(5)))
}

async fn vmrest_driver(
    fixture: &Fixture,
    daemon: &FakeDaemon,
    daemon_networking: bool,
) -> VmrestDriver {
    let base = BaseDriver::new(&fixture.config(""), fixture.paths.clone())
        .await
        .unwrap();
    let fallback = Backend::Advanced(AdvancedDriver::new(Arc::new(base)));
    VmrestDriver::new(client(daemon).await, fallback, daemon_networking)
}

#[tokio::test]
#[serial]
async fn test_selection_falls_back_when_vmrest_cannot_start() {
    let fixture = Fixture::new();
    for name in ["", "hyperdrive"] {
        let driver = Driver::new(&fixture.lifecycle, fixture.config(name))
            .await
            .unwrap();
        assert_eq!(driver.get_driver().name(), "advanced");
        assert_eq!(driver.vmrun().unwrap().mode(), Mode::Clone);
    }
}

#[tokio::test]
#[serial]
async fn test_selection_upgrades_to_vmrest() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;

    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon))
        .await
        .unwrap();
    assert_eq!(driver.get_driver().name(), "vmrest");
    match driver.get_driver() {
        Backend::Vmrest(vmrest) => assert_eq!(vmrest.fallback().name(), "advanced"),
        other => panic!("unexpected backend {:?}", other),
    }
    assert!(driver.validation_error().is_none());
    assert_eq!(driver.vmrun().unwrap().mode(), Mode::Rest);

    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon).clone_with_vmrun())
        .await
        .unwrap();
    assert_eq!(driver.get_driver().name(), "vmrest");
    assert_eq!(driver.vmrun().unwrap().mode(), Mode::Clone);
}

#[tokio::test]
#[serial]
async fn test_selection_honours_license() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;

    let config = auto(&fixture, &daemon).with_license_override("standard".to_string());
    let driver = Driver::new(&fixture.lifecycle, config).await.unwrap();
    let expected = if platform::requires_daemon_networking().await {
        "vmrest"
    } else {
        "advanced"
    };
    assert_eq!(driver.get_driver().name(), expected);

    // without product information the daemon is never tried
    fs::remove_file(&fixture.paths.product).unwrap();
    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon))
        .await
        .unwrap();
    assert_eq!(driver.get_driver().name(), "advanced");
    assert!(daemon.requests().is_empty());
}

#[tokio::test]
#[serial]
async fn test_rest_mode_create_and_delete() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;
    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon))
        .await
        .unwrap();
    let engine = driver.vmrun().unwrap();

    let vm = engine
        .create(CreateVirtualMachine {
            template: TEMPLATE_ID.to_string(),
            name: "worker-1".to_string(),
            vcpus: 2,
            memory: 2048,
            ..Default::default()
        })
        .await
        .unwrap();
    let expected_path = platform::vm_descriptor_path(&fixture.vm_folder, "worker-1");
    assert_eq!(vm.uuid, "CLONE1");
    assert_eq!(vm.name, "worker-1");
    assert_eq!(vm.path, expected_path);
    assert_eq!(vm.vcpus, 2);
    assert_eq!(vm.memory, 2048);
    assert!(daemon.requests().contains(&"POST /api/vms".to_string()));
    assert!(fixture.calls_to("clone").is_empty());

    engine.delete(&vm.uuid).await.unwrap();
    assert!(daemon
        .requests()
        .contains(&"DELETE /api/vms/CLONE1".to_string()));
    assert!(fixture.calls_to("deleteVM").is_empty());
    assert!(!expected_path.exists());

    let err = engine.virtual_machine_by_uuid(&vm.uuid).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
#[serial]
async fn test_vmrest_port_forwards_keep_descriptions() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;
    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon))
        .await
        .unwrap();
    let description = format!("{}{}", PORTFWD_PREFIX, fixture.template.display());

    driver
        .add_port_fwd(vec![ssh_forward(description.clone())])
        .await
        .unwrap();
    let live = daemon.with_state(|state| {
        state
            .forwards
            .get("vmnet8")
            .cloned()
            .unwrap_or_default()
    });
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].desc, MANAGED_DESCRIPTION);
    assert_eq!(live[0].guest.ip, "172.16.10.5");
    assert!(fixture.calls_to("network-helper").is_empty());

    let store = NatStore::load(&fixture.settings_dir.join(NAT_SETTINGS_FILE)).unwrap();
    assert_eq!(store.port_forwards().len(), 1);
    assert_eq!(store.port_forwards()[0].description, description);

    let forwards = driver.port_fwds(None).await.unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].slot_number, 8);
    assert_eq!(forwards[0].description, description);

    driver
        .delete_port_fwd(vec![ssh_forward(description)])
        .await
        .unwrap();
    assert!(driver.port_fwds(Some(8)).await.unwrap().is_empty());
    let store = NatStore::load(&fixture.settings_dir.join(NAT_SETTINGS_FILE)).unwrap();
    assert!(store.port_forwards().is_empty());
}

#[tokio::test]
#[serial]
async fn test_vmrest_dhcp_reservation() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;
    let driver = Driver::new(&fixture.lifecycle, auto(&fixture, &daemon))
        .await
        .unwrap();

    driver
        .reserve_dhcp_address(8, "00:50:56:2a:00:05", "172.16.10.5")
        .await
        .unwrap();
    let reservations = daemon.with_state(|state| state.reservations.clone());
    assert_eq!(
        reservations,
        vec![(
            "vmnet8".to_string(),
            "00:50:56:2a:00:05".to_string(),
            "172.16.10.5".to_string()
        )]
    );
}

#[tokio::test]
#[serial]
async fn test_vmrest_vmnets() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;
    let driver = vmrest_driver(&fixture, &daemon, false).await;

    let names: Vec<String> = driver
        .vmnets()
        .await
        .unwrap()
        .into_iter()
        .map(|vmnet| vmnet.name)
        .collect();
    assert_eq!(names, vec!["vmnet1".to_string(), "vmnet8".to_string()]);

    let created = driver
        .add_vmnet(&Vmnet {
            kind: "hostOnly".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.name, "vmnet2");
    assert!(daemon.requests().contains(&"POST /api/vmnets".to_string()));
    let err = driver.add_vmnet(&created).await.unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    // custom addressing is left to the fallback
    let posts_before = daemon
        .requests()
        .iter()
        .filter(|r| r.as_str() == "POST /api/vmnets")
        .count();
    driver
        .add_vmnet(&Vmnet {
            kind: "hostOnly".to_string(),
            subnet: "192.168.100.0".to_string(),
            mask: "255.255.255.0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let posts_after = daemon
        .requests()
        .iter()
        .filter(|r| r.as_str() == "POST /api/vmnets")
        .count();
    assert_eq!(posts_before, posts_after);
    let networking = fs::read_to_string(&fixture.paths.networking).unwrap();
    assert!(networking.contains("192.168.100.0"));
}

#[tokio::test]
#[serial]
async fn test_vmrest_vmnets_when_daemon_is_the_only_way() {
    let fixture = Fixture::new();
    let daemon = daemon(&fixture).await;
    let driver = vmrest_driver(&fixture, &daemon, true).await;
    let networking = fs::read_to_string(&fixture.paths.networking).unwrap();

    let err = driver
        .add_vmnet(&Vmnet {
            kind: "hostOnly".to_string(),
            subnet: "192.168.100.0".to_string(),
            mask: "255.255.255.0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let vmnet = Vmnet {
        name: "vmnet1".to_string(),
        kind: "hostOnly".to_string(),
        ..Default::default()
    };
    let err = driver.update_vmnet(&vmnet).await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    let err = driver.delete_vmnet("vmnet1").await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    assert_eq!(fs::read_to_string(&fixture.paths.networking).unwrap(), networking);
    assert!(fixture.calls_to("network-helper").is_empty());
    assert!(daemon.requests().is_empty());
}
