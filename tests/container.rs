//! Integration tests for runtime command generation.
//!
//! These tests verify:
//! - Gateway contributions to the execute command
//! - Override de-duplication across gateways
//! - Determinism and length limits over arbitrary inputs

use std::path::Path;

use pelagicontain::container::{Container, RuntimePrograms};
use pelagicontain::error::ContainerError;
use pelagicontain::gateway::{self, Gateway};
use proptest::prelude::*;

fn canonical(root: &Path, name: &str) -> Vec<Box<dyn Gateway>> {
    gateway::canonical_set(root, name, Path::new("/run/pulse/native"), None)
}

#[test]
fn test_execute_carries_gateway_environment() {
    let root = Path::new("/tmp/c1");
    let container = Container::new("pelagicontain-abc", "/etc/pelagicontain");
    let gateways = canonical(root, container.name());

    let commands = container
        .commands(
            "/controller/controller",
            &gateways,
            &root.join("rootfs/"),
            &RuntimePrograms::default(),
            4096,
        )
        .expect("failed to build commands");

    assert_eq!(
        commands.execute,
        "lxc-execute -n pelagicontain-abc -f /etc/pelagicontain \
         -s lxc.rootfs=/tmp/c1/rootfs/ \
         -s 'lxc.mount.entry=/tmp/c1/gateways gateways none bind,create=dir 0 0' \
         -- env PELAGICONTAIN_NETWORK_CONFIG=/gateways/net_pelagicontain-abc.json \
         PULSE_SERVER=unix:/gateways/pulse-pelagicontain-abc.sock \
         DBUS_SESSION_BUS_ADDRESS=unix:path=/gateways/sess_pelagicontain-abc.sock \
         DBUS_SYSTEM_BUS_ADDRESS=unix:path=/gateways/sys_pelagicontain-abc.sock \
         /controller/controller"
    );
}

#[test]
fn test_mount_override_emitted_once() {
    let root = Path::new("/tmp/c1");
    let container = Container::new("pelagicontain-abc", "/etc/pelagicontain");
    let gateways = canonical(root, container.name());

    let commands = container
        .commands("/bin/app", &gateways, &root.join("rootfs/"), &RuntimePrograms::default(), 4096)
        .expect("failed to build commands");

    assert_eq!(commands.execute.matches("lxc.mount.entry=").count(), 1);
}

#[test]
fn test_custom_runtime_programs_are_quoted() {
    let runtime = RuntimePrograms {
        create: "/opt/lxc tools/create".to_string(),
        execute: "lxc-execute".to_string(),
        destroy: "lxc-destroy".to_string(),
    };
    let container = Container::new("pelagicontain-abc", "/etc/pelagicontain");
    let commands = container
        .commands("/bin/app", &[], Path::new("/tmp/rootfs/"), &runtime, 4096)
        .expect("failed to build commands");

    assert!(commands.create.starts_with("'/opt/lxc tools/create' -n pelagicontain-abc"));
}

#[test]
fn test_limit_applies_to_gateway_contributions() {
    let root = Path::new("/tmp/c1");
    let container = Container::new("pelagicontain-abc", "/etc/pelagicontain");
    let gateways = canonical(root, container.name());

    // Fits without gateways, exceeds the limit once their environment is added.
    let bare = container
        .commands("/bin/app", &[], &root.join("rootfs/"), &RuntimePrograms::default(), 4096)
        .expect("failed to build commands");
    let limit = bare.execute.len() + 10;

    let result = container.commands(
        "/bin/app",
        &gateways,
        &root.join("rootfs/"),
        &RuntimePrograms::default(),
        limit,
    );
    assert!(matches!(result, Err(ContainerError::CommandTooLong { .. })));
}

proptest! {
    #[test]
    fn prop_commands_are_deterministic(
        command in "[a-z/]{1,20}( [a-zA-Z0-9 '\"$]{0,40})?",
        root in "/[a-z]{1,12}",
    ) {
        let container = Container::new("pelagicontain-prop", "/etc/pelagicontain");
        let root = Path::new(&root);
        let first = container.commands(
            &command,
            &canonical(root, container.name()),
            &root.join("rootfs/"),
            &RuntimePrograms::default(),
            4096,
        );
        let second = container.commands(
            &command,
            &canonical(root, container.name()),
            &root.join("rootfs/"),
            &RuntimePrograms::default(),
            4096,
        );
        prop_assert_eq!(first.ok(), second.ok());
    }

    #[test]
    fn prop_length_limit_is_exact(len in 1usize..400, limit in 64usize..300) {
        let container = Container::new("pelagicontain-prop", "/etc/pelagicontain");
        let command = "x".repeat(len);
        match container.commands(
            &command,
            &[],
            Path::new("/tmp/rootfs/"),
            &RuntimePrograms::default(),
            limit,
        ) {
            Ok(commands) => {
                for (_, generated) in commands.iter() {
                    prop_assert!(generated.len() <= limit);
                }
            }
            Err(ContainerError::CommandTooLong { length, limit: reported, .. }) => {
                prop_assert_eq!(reported, limit);
                prop_assert!(length > limit);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}
