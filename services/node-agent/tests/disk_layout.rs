//! Integration tests for disk layout flows.
//!
//! These drive a `DiskManager` wired to mock tools through complete flows:
//! 1. Ephemeral disk partition, format, mount, scrub and swap
//! 2. Root disk fallback when the node has no ephemeral disk
//! 3. Raw ephemeral disk labeling
//! 4. Persistent disk mount, migration and unmount
//! 5. System directories moved onto the data directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bedrock_node_agent::config::{AgentPaths, DiskOptions};
use bedrock_node_agent::disk::{
    ephemeral_partition_plan, DevicePathResolutionType, DiskCollaborators, DiskError, DiskManager,
    DiskSettings, FileSystemType, MockFormatter, MockMounter, MockMountsSearcher, MockPartitioner, MockResolver,
    Mount, MountCall, Partition, Partitioners, MIN_ROOT_EPHEMERAL_SPACE,
};
use bedrock_node_agent::system::{MockCmdResult, MockCmdRunner, MockMemoryStats};

const GIB: u64 = 1024 * 1024 * 1024;

struct Harness {
    runner: Arc<MockCmdRunner>,
    resolver: Arc<MockResolver>,
    partitioner: Arc<MockPartitioner>,
    root_partitioner: Arc<MockPartitioner>,
    formatter: Arc<MockFormatter>,
    mounter: Arc<MockMounter>,
    mounts: Arc<MockMountsSearcher>,
    manager: DiskManager,
}

fn harness(base: &Path, options: DiskOptions) -> Harness {
    harness_with(base, options, |partitioners| partitioners)
}

fn harness_with(
    base: &Path,
    options: DiskOptions,
    partitioners: impl FnOnce(Partitioners) -> Partitioners,
) -> Harness {
    let runner = Arc::new(MockCmdRunner::new());
    let resolver = Arc::new(MockResolver::new());
    let partitioner = Arc::new(MockPartitioner::new());
    let root_partitioner = Arc::new(MockPartitioner::new());
    let formatter = Arc::new(MockFormatter::new());
    let mounter = Arc::new(MockMounter::new());
    let mounts = Arc::new(MockMountsSearcher::new(vec![Mount::new("/dev/sda1", "/")]));

    let collaborators = DiskCollaborators {
        runner: runner.clone(),
        resolver: resolver.clone(),
        partitioners: partitioners(Partitioners::new(
            partitioner.clone(),
            root_partitioner.clone(),
        )),
        formatter: formatter.clone(),
        mounter: mounter.clone(),
        mounts: mounts.clone(),
        memory: Arc::new(MockMemoryStats::new(2 * GIB)),
    };

    Harness {
        manager: DiskManager::new(collaborators, AgentPaths::new(base), options),
        runner,
        resolver,
        partitioner,
        root_partitioner,
        formatter,
        mounter,
        mounts,
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_ephemeral_disk_setup() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.partitioner.set_device_size("/dev/sdb", 16 * GIB);

    h.manager
        .setup_ephemeral_disk(Some("/dev/sdb"), None)
        .await
        .unwrap();

    let expected = ephemeral_partition_plan(16 * GIB, None, 2 * GIB).unwrap();
    assert_eq!(
        h.partitioner.calls(),
        vec![("/dev/sdb".to_string(), expected)]
    );
    assert_eq!(
        h.formatter.calls(),
        vec![
            ("/dev/sdb1".to_string(), FileSystemType::Swap),
            ("/dev/sdb2".to_string(), FileSystemType::Ext4),
        ]
    );
    assert_eq!(
        h.mounter.calls(),
        vec![
            MountCall::Mount {
                partition: "/dev/sdb2".to_string(),
                mount_point: dir.path().join("data"),
                options: vec![],
            },
            MountCall::SwapOn("/dev/sdb1".to_string()),
        ]
    );
    assert!(dir.path().join("data").is_dir());
    assert!(!h.root_partitioner.was_called());
}

#[tokio::test]
async fn test_ephemeral_disk_without_swap() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.partitioner.set_device_size("/dev/nvme1n1", 8 * GIB);

    h.manager
        .setup_ephemeral_disk(Some("/dev/nvme1n1"), Some(0))
        .await
        .unwrap();

    assert_eq!(h.formatter.partitions(), vec!["/dev/nvme1n1p1"]);
    assert!(h.mounter.swap_ons().is_empty());
}

#[tokio::test]
async fn test_ephemeral_swap_larger_than_disk() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.partitioner.set_device_size("/dev/sdb", GIB);

    let err = h
        .manager
        .setup_ephemeral_disk(Some("/dev/sdb"), Some(2 * GIB))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("Calculating partition sizes"));
    assert!(!h.partitioner.was_called());
    assert!(h.formatter.calls().is_empty());
}

#[tokio::test]
async fn test_scrub_clears_data_for_new_stemcell() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        scrub_ephemeral_disk: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    h.partitioner.set_device_size("/dev/sdb", 16 * GIB);

    let paths = AgentPaths::new(dir.path());
    std::fs::create_dir_all(paths.etc_dir()).unwrap();
    std::fs::write(paths.stemcell_version_path(), "3586.7\n").unwrap();
    std::fs::create_dir_all(paths.data_dir().join("jobs")).unwrap();
    std::fs::write(paths.data_dir().join("stale.log"), "old").unwrap();

    h.manager
        .setup_ephemeral_disk(Some("/dev/sdb"), None)
        .await
        .unwrap();

    assert!(!paths.data_dir().join("stale.log").exists());
    assert!(!paths.data_dir().join("jobs").exists());
    assert_eq!(
        std::fs::read_to_string(paths.agent_version_path()).unwrap(),
        "3586.7"
    );

    // Same stemcell: nothing is removed on the next boot.
    std::fs::write(paths.data_dir().join("fresh.log"), "new").unwrap();
    h.manager
        .setup_ephemeral_disk(Some("/dev/sdb"), None)
        .await
        .unwrap();
    assert!(paths.data_dir().join("fresh.log").exists());
}

#[tokio::test]
async fn test_scrub_without_stemcell_version_fails() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        scrub_ephemeral_disk: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    h.partitioner.set_device_size("/dev/sdb", 16 * GIB);

    let err = h
        .manager
        .setup_ephemeral_disk(Some("/dev/sdb"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DiskError::State { .. }));
    assert!(h.mounter.swap_ons().is_empty());
}

#[tokio::test]
async fn test_root_disk_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        create_partition_if_no_ephemeral_disk: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    h.runner
        .add_result("readlink -f /dev/sda1", MockCmdResult::stdout("/dev/sda1\n"));
    h.root_partitioner.set_device_size("/dev/sda", 20 * GIB);

    h.manager.setup_ephemeral_disk(None, None).await.unwrap();

    assert!(!h.partitioner.was_called());
    let calls = h.root_partitioner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "/dev/sda");
    assert_eq!(
        h.formatter.calls(),
        vec![
            ("/dev/sda2".to_string(), FileSystemType::Swap),
            ("/dev/sda3".to_string(), FileSystemType::Ext4),
        ]
    );
    assert_eq!(h.mounter.swap_ons(), vec!["/dev/sda2"]);
}

#[tokio::test]
async fn test_root_disk_fallback_needs_space() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        create_partition_if_no_ephemeral_disk: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    h.runner
        .add_result("readlink -f /dev/sda1", MockCmdResult::stdout("/dev/sda1\n"));
    h.root_partitioner
        .set_device_size("/dev/sda", MIN_ROOT_EPHEMERAL_SPACE - 1);

    let err = h.manager.setup_ephemeral_disk(None, None).await.unwrap_err();

    assert!(matches!(err, DiskError::InsufficientSpace { .. }));
    assert!(!h.root_partitioner.was_called());
}

#[tokio::test]
async fn test_no_ephemeral_disk_without_root_partitioning_fails() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());

    let err = h.manager.setup_ephemeral_disk(None, None).await.unwrap_err();

    assert!(matches!(err, DiskError::RootAsEphemeral));
    assert!(err
        .to_string()
        .contains("cannot use root partition as ephemeral disk"));
    assert!(!h.partitioner.was_called());
    assert!(!h.root_partitioner.was_called());
    assert!(h.formatter.calls().is_empty());
    assert!(h.mounter.calls().is_empty());
}

#[tokio::test]
async fn test_grow_root_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.mounts.set_mounts(vec![
        Mount::new("rootfs", "/"),
        Mount::new("/dev/disk/by-uuid/abc", "/"),
    ]);
    h.runner.add_result(
        "readlink -f /dev/disk/by-uuid/abc",
        MockCmdResult::stdout("/dev/nvme0n1p1\n"),
    );

    h.manager
        .grow_root_filesystem(Some("/dev/nvme1n1"))
        .await
        .unwrap();

    assert_eq!(
        h.runner.run_commands(),
        vec![
            vec!["readlink", "-f", "/dev/disk/by-uuid/abc"],
            vec!["growpart", "/dev/nvme0n1", "1"],
            vec!["resize2fs", "-f", "/dev/nvme0n1p1"],
        ]
    );
}

#[tokio::test]
async fn test_grow_root_filesystem_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());

    h.manager.grow_root_filesystem(None).await.unwrap();
    h.runner.set_exists(false);
    h.manager
        .grow_root_filesystem(Some("/dev/sdb"))
        .await
        .unwrap();

    assert!(h.runner.run_commands().is_empty());
}

#[tokio::test]
async fn test_label_raw_ephemeral_disks() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.runner.add_result(
        "parted -s /dev/xvdb p",
        MockCmdResult::failure("Error: /dev/xvdb: unrecognised disk label"),
    );
    h.runner.add_result(
        "parted -s /dev/xvdc p",
        MockCmdResult::stdout(
            "Model: Xen Virtual Block Device (xvd)\n\
             Disk /dev/xvdc: 10.7GB\n\
             Partition Table: gpt\n\
             \n\
             Number  Start   End     Size    File system  Name  Flags\n \
             1      1049kB  10.7GB  10.7GB               raw-ephemeral-1\n",
        ),
    );
    h.runner.add_result(
        "parted -s /dev/xvdd p",
        MockCmdResult::stdout(
            "Disk /dev/xvdd: 10.7GB\n\
             Partition Table: loop\n\
             \n\
             Number  Start  End     Size    File system  Flags\n \
             1      0.00B  10.7GB  10.7GB  ext4\n",
        ),
    );

    let disks = vec![
        DiskSettings::with_path("/dev/xvdb"),
        DiskSettings::with_path("/dev/xvdc"),
        DiskSettings::with_path("/dev/xvdd"),
    ];
    h.manager.label_raw_ephemeral_disks(&disks).await.unwrap();

    let labels: Vec<Vec<String>> = h
        .runner
        .run_commands()
        .into_iter()
        .filter(|argv| argv.iter().any(|a| a == "mklabel"))
        .collect();
    assert_eq!(
        labels,
        vec![
            vec!["parted", "-s", "/dev/xvdb", "mklabel", "gpt", "unit", "%", "mkpart", "raw-ephemeral-0", "0", "100"],
            vec!["parted", "-s", "/dev/xvdd", "mklabel", "gpt", "unit", "%", "mkpart", "raw-ephemeral-2", "0", "100"],
        ]
    );
}

#[tokio::test]
async fn test_persistent_disk_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let paths = AgentPaths::new(dir.path());
    let disk = DiskSettings::new("disk-1", "/dev/sdf");

    h.manager.mount_persistent_disk(&disk).await.unwrap();

    assert_eq!(
        h.partitioner.calls(),
        vec![("/dev/sdf".to_string(), vec![Partition::linux(0)])]
    );
    assert_eq!(
        h.formatter.calls(),
        vec![("/dev/sdf1".to_string(), FileSystemType::Ext4)]
    );
    assert_eq!(
        h.mounter.mounts(),
        vec![("/dev/sdf1".to_string(), paths.store_dir(), vec![])]
    );
    assert_eq!(
        h.manager.managed_disk_id().await.unwrap().as_deref(),
        Some("disk-1")
    );

    // A second mount of the same disk is a no-op.
    h.mounter.set_mount_point(paths.store_dir(), "/dev/sdf1");
    h.mounter.set_mounted("/dev/sdf1");
    h.manager.mount_persistent_disk(&disk).await.unwrap();
    assert_eq!(h.partitioner.calls().len(), 1);
    assert_eq!(h.mounter.mounts().len(), 1);

    assert!(h.manager.is_persistent_disk_mounted(&disk).await.unwrap());
    assert!(h.manager.unmount_persistent_disk(&disk).await.unwrap());
}

#[tokio::test]
async fn test_persistent_disk_migration() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let paths = AgentPaths::new(dir.path());
    h.mounter.set_mount_point(paths.store_dir(), "/dev/sdf1");

    let new_disk = DiskSettings::new("disk-2", "/dev/sdg");
    h.manager.mount_persistent_disk(&new_disk).await.unwrap();

    assert_eq!(
        h.mounter.mounts(),
        vec![("/dev/sdg1".to_string(), paths.store_migration_dir(), vec![])]
    );
    assert!(paths.store_migration_dir().is_dir());
    assert_eq!(
        h.manager.managed_disk_id().await.unwrap().as_deref(),
        Some("disk-2")
    );

    h.manager
        .migrate_persistent_disk(&paths.store_dir(), &paths.store_migration_dir())
        .await
        .unwrap();

    let calls = h.mounter.calls();
    assert!(calls.contains(&MountCall::RemountReadOnly(paths.store_dir())));
    assert!(calls.contains(&MountCall::Remount {
        from: paths.store_migration_dir(),
        to: paths.store_dir(),
        options: vec![],
    }));
    let copy = h
        .runner
        .run_commands()
        .into_iter()
        .find(|argv| argv[0] == "sh")
        .unwrap();
    assert_eq!(
        copy[2],
        format!(
            "(tar -C {} -cf - .) | (tar -C {} -xpf -)",
            paths.store_dir().display(),
            paths.store_migration_dir().display()
        )
    );
}

#[tokio::test]
async fn test_persistent_disk_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let disk = DiskSettings::new("disk-9", "/dev/sdz");
    h.resolver.set_timed_out("disk-9");

    assert!(!h.manager.unmount_persistent_disk(&disk).await.unwrap());
    assert!(!h.manager.is_persistent_disk_mounted(&disk).await.unwrap());
    assert!(!h.manager.is_persistent_disk_mountable(&disk).await.unwrap());
    assert!(h.manager.mount_persistent_disk(&disk).await.is_err());
}

#[tokio::test]
async fn test_preformatted_persistent_disk_mounts_device() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        use_preformatted_persistent_disk: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    let paths = AgentPaths::new(dir.path());
    let disk = DiskSettings::new("disk-1", "/dev/sdf");

    h.manager.mount_persistent_disk(&disk).await.unwrap();

    assert!(!h.partitioner.was_called());
    assert!(h.formatter.calls().is_empty());
    assert_eq!(
        h.mounter.mounts(),
        vec![("/dev/sdf".to_string(), paths.store_dir(), vec![])]
    );

    h.mounter.set_mounted("/dev/sdf");
    assert!(h.manager.is_persistent_disk_mounted(&disk).await.unwrap());
}

#[tokio::test]
async fn test_persistent_disk_unsupported_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let disk = DiskSettings::new("disk-1", "/dev/sdf").with_filesystem("blahblah");

    let err = h.manager.mount_persistent_disk(&disk).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "The filesystem type \"blahblah\" is not supported"
    );
    assert!(!h.partitioner.was_called());
    assert!(h.formatter.calls().is_empty());
    assert!(h.mounter.mounts().is_empty());
}

#[tokio::test]
async fn test_persistent_disk_named_partitioner() {
    let dir = tempfile::tempdir().unwrap();
    let parted = Arc::new(MockPartitioner::new());
    let named = parted.clone();
    let h = harness_with(dir.path(), DiskOptions::default(), move |p| {
        p.with_named("parted", named)
    });
    let disk = DiskSettings::new("disk-1", "/dev/sdf").with_partitioner("parted");

    h.manager.mount_persistent_disk(&disk).await.unwrap();

    assert_eq!(
        parted.calls(),
        vec![("/dev/sdf".to_string(), vec![Partition::linux(0)])]
    );
    assert!(!h.partitioner.was_called());
    assert_eq!(
        h.formatter.calls(),
        vec![("/dev/sdf1".to_string(), FileSystemType::Ext4)]
    );

    let unknown = DiskSettings::new("disk-2", "/dev/sdg").with_partitioner("fdisk");
    let err = h.manager.mount_persistent_disk(&unknown).await.unwrap_err();
    assert!(matches!(err, DiskError::UnknownPartitioner(ref name) if name == "fdisk"));
    assert_eq!(parted.calls().len(), 1);
}

#[tokio::test]
async fn test_persistent_disk_mountable() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let disk = DiskSettings::new("disk-1", "/dev/sdf");
    h.runner.add_result(
        "sfdisk -d /dev/sdf",
        MockCmdResult::stdout(
            "label: dos\ndevice: /dev/sdf\nunit: sectors\n\n/dev/sdf1 : start=        2048, size=    20969472, type=83\n",
        ),
    );
    h.runner.add_result(
        "sfdisk -d /dev/sdf",
        MockCmdResult::failure("sfdisk: /dev/sdf: does not contain a recognized partition table"),
    );

    assert!(h.manager.is_persistent_disk_mountable(&disk).await.unwrap());
    assert!(!h.manager.is_persistent_disk_mountable(&disk).await.unwrap());
    assert_eq!(
        h.runner.run_commands(),
        vec![vec!["sfdisk", "-d", "/dev/sdf"]; 2]
    );
}

#[tokio::test]
async fn test_multipath_migration_flushes_old_map() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        device_path_resolution_type: DevicePathResolutionType::Multipath,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    let paths = AgentPaths::new(dir.path());
    h.mounter
        .set_mount_point(paths.store_dir(), "/dev/mapper/mpathb-part1");
    h.runner.add_result(
        "multipath -ll",
        MockCmdResult::stdout(
            "mpatha (3600a098038303053453f463045727a41) dm-0 NETAPP,LUN C-Mode\n\
size=10G features='3 queue_if_no_path' hwhandler='1 alua' wp=rw\n\
mpathb (3600a098038303053453f463045727a42) dm-3 NETAPP,LUN C-Mode\n\
size=20G features='3 queue_if_no_path' hwhandler='1 alua' wp=rw\n",
        ),
    );

    h.manager
        .migrate_persistent_disk(&paths.store_dir(), &paths.store_migration_dir())
        .await
        .unwrap();

    let commands = h.runner.run_commands();
    let tail: Vec<_> = commands.iter().skip_while(|argv| argv[0] != "sh").collect();
    assert_eq!(tail.len(), 3);
    assert_eq!(*tail[1], vec!["multipath", "-ll"]);
    assert_eq!(*tail[2], vec!["multipath", "-f", "mpathb"]);
    assert!(h.mounter.calls().contains(&MountCall::Remount {
        from: paths.store_migration_dir(),
        to: paths.store_dir(),
        options: vec![],
    }));
}

#[tokio::test]
async fn test_setup_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let paths = AgentPaths::new(dir.path());
    let sys = paths.data_sys_dir();

    h.manager.setup_data_dir().await.unwrap();

    let chowned: Vec<PathBuf> = vec![
        sys.clone(),
        sys.join("log"),
        paths.data_dir().join("jobs"),
        paths.data_dir().join("packages"),
        sys.join("run"),
    ];
    let expected: Vec<Vec<String>> = chowned
        .iter()
        .map(|p| argv(&["chown", "root:vcap", &display(p)]))
        .collect();
    assert_eq!(h.runner.run_commands(), expected);
    assert_eq!(
        h.mounter.filesystem_mounts(),
        vec![(
            "tmpfs".to_string(),
            sys.join("run"),
            "tmpfs".to_string(),
            argv(&["size=1m"])
        )]
    );
    assert_eq!(std::fs::read_link(paths.sys_dir()).unwrap(), sys);
    assert!(sys.join("log").is_dir());
    assert!(paths.data_dir().join("jobs").is_dir());
    assert!(paths.data_dir().join("packages").is_dir());

    // Running again replaces the link.
    h.manager.setup_data_dir().await.unwrap();
    assert_eq!(std::fs::read_link(paths.sys_dir()).unwrap(), sys);
}

#[tokio::test]
async fn test_setup_data_dir_with_mounted_run_dir() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let paths = AgentPaths::new(dir.path());
    let run_dir = paths.data_sys_dir().join("run");
    h.mounter.set_mount_point(&run_dir, "tmpfs");

    h.manager.setup_data_dir().await.unwrap();

    assert!(h.mounter.filesystem_mounts().is_empty());
    assert!(!run_dir.exists());
    assert_eq!(h.runner.run_commands().len(), 4);
}

#[tokio::test]
async fn test_setup_tmp_dir_bind_mounts_root_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let paths = AgentPaths::new(dir.path());
    let root_tmp = display(&paths.root_tmp_dir());

    h.manager.setup_tmp_dir().await.unwrap();

    assert_eq!(
        h.runner.run_commands(),
        vec![
            argv(&["chown", "root:vcap", "/tmp"]),
            argv(&["chmod", "1770", "/tmp"]),
            argv(&["chown", "root:vcap", "/var/tmp"]),
            argv(&["chmod", "1770", "/var/tmp"]),
            argv(&["mkdir", "-p", &root_tmp]),
            argv(&["chmod", "1770", &root_tmp]),
            argv(&["chown", "root:vcap", "/tmp"]),
            argv(&["chown", "root:vcap", "/var/tmp"]),
        ]
    );
    assert_eq!(
        h.mounter.filesystem_mounts(),
        vec![
            (root_tmp.clone(), PathBuf::from("/tmp"), String::new(), argv(&["bind"])),
            (root_tmp.clone(), PathBuf::from("/var/tmp"), String::new(), argv(&["bind"])),
        ]
    );
    assert_eq!(
        h.mounter.remounts_in_place(),
        vec![
            (PathBuf::from("/tmp"), argv(&["nodev", "noexec", "nosuid"])),
            (PathBuf::from("/var/tmp"), argv(&["nodev", "noexec", "nosuid"])),
        ]
    );
    assert!(paths.tmp_dir().is_dir());
}

#[tokio::test]
async fn test_setup_tmp_dir_remounts_already_mounted() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.mounter.set_mounted("/tmp");
    h.mounter.set_mounted("/var/tmp");

    h.manager.setup_tmp_dir().await.unwrap();

    assert!(h.mounter.filesystem_mounts().is_empty());
    assert_eq!(h.mounter.remounts_in_place().len(), 2);
    assert_eq!(h.runner.run_commands().len(), 6);
}

#[tokio::test]
async fn test_setup_tmp_dir_keeps_default_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let options = DiskOptions {
        use_default_tmp_dir: true,
        ..DiskOptions::default()
    };
    let h = harness(dir.path(), options);
    let paths = AgentPaths::new(dir.path());

    h.manager.setup_tmp_dir().await.unwrap();

    assert!(h.mounter.calls().is_empty());
    assert_eq!(h.runner.run_commands().len(), 4);
    assert!(paths.tmp_dir().is_dir());
    assert!(!paths.root_tmp_dir().exists());
}

#[tokio::test]
async fn test_setup_tmp_dir_mount_check_error() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.mounter.fail_is_mounted("fake-is-mounted-error");

    let err = h.manager.setup_tmp_dir().await.unwrap_err();

    assert!(err.to_string().contains("fake-is-mounted-error"));
    assert!(h.mounter.calls().is_empty());
}

fn log_dir_commands(root_log: &Path) -> Vec<Vec<String>> {
    let root = display(root_log);
    let audit = display(&root_log.join("audit"));
    let sysstat = display(&root_log.join("sysstat"));
    let btmp = display(&root_log.join("btmp"));
    let wtmp = display(&root_log.join("wtmp"));
    vec![
        argv(&["chmod", "0771", &root]),
        argv(&["mkdir", "-p", &audit]),
        argv(&["chmod", "0750", &audit]),
        argv(&["mkdir", "-p", &sysstat]),
        argv(&["chmod", "0755", &sysstat]),
        argv(&["chown", "root:syslog", &root]),
        argv(&["touch", &btmp]),
        argv(&["chown", "root:utmp", &btmp]),
        argv(&["chmod", "0600", &btmp]),
        argv(&["touch", &wtmp]),
        argv(&["chown", "root:utmp", &wtmp]),
        argv(&["chmod", "0664", &wtmp]),
    ]
}

#[tokio::test]
async fn test_setup_log_dir() {
    let dir = tempfile::tempdir().unwrap();
    let passwd = dir.path().join("passwd");
    std::fs::write(&passwd, "root:x:0:0:root:/root:/bin/bash\nvcap:x:1000:1000::/home/vcap:/bin/bash\n")
        .unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let manager = h.manager.with_passwd_path(&passwd);
    let root_log = AgentPaths::new(dir.path()).root_log_dir();

    manager.setup_log_dir().await.unwrap();

    assert_eq!(h.runner.run_commands(), log_dir_commands(&root_log));
    assert_eq!(
        h.mounter.filesystem_mounts(),
        vec![(
            display(&root_log),
            PathBuf::from("/var/log"),
            String::new(),
            argv(&["bind"])
        )]
    );
    assert!(root_log.is_dir());
}

#[tokio::test]
async fn test_setup_log_dir_with_chrony_user() {
    let dir = tempfile::tempdir().unwrap();
    let passwd = dir.path().join("passwd");
    std::fs::write(
        &passwd,
        "root:x:0:0:root:/root:/bin/bash\n_chrony:x:112:118:Chrony daemon,,,:/var/lib/chrony:/usr/sbin/nologin\n",
    )
    .unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let manager = h.manager.with_passwd_path(&passwd);
    let root_log = AgentPaths::new(dir.path()).root_log_dir();
    let chrony = display(&root_log.join("chrony"));
    h.mounter.set_mounted("/var/log");

    manager.setup_log_dir().await.unwrap();

    let mut expected = log_dir_commands(&root_log);
    expected.push(argv(&["mkdir", "-p", &chrony]));
    expected.push(argv(&["chmod", "0700", &chrony]));
    expected.push(argv(&["chown", "_chrony:_chrony", &chrony]));
    assert_eq!(h.runner.run_commands(), expected);
    assert!(h.mounter.filesystem_mounts().is_empty());
}

#[tokio::test]
async fn test_setup_log_dir_without_passwd_file() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let manager = h.manager.with_passwd_path(dir.path().join("missing"));
    let root_log = AgentPaths::new(dir.path()).root_log_dir();

    manager.setup_log_dir().await.unwrap();

    assert_eq!(h.runner.run_commands(), log_dir_commands(&root_log));
}

#[tokio::test]
async fn test_setup_blobs_dir() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    let blobs = AgentPaths::new(dir.path()).blobs_dir();

    h.manager.setup_blobs_dir().await.unwrap();

    assert!(blobs.is_dir());
    assert_eq!(
        h.runner.run_commands(),
        vec![argv(&["chown", "root:vcap", &display(&blobs)])]
    );
}

#[tokio::test]
async fn test_setup_home_dir() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());

    h.manager.setup_home_dir().await.unwrap();

    assert_eq!(
        h.mounter.calls(),
        vec![
            MountCall::MountFilesystem {
                source: "/home".to_string(),
                mount_point: PathBuf::from("/home"),
                fs_type: String::new(),
                options: argv(&["bind"]),
            },
            MountCall::RemountInPlace {
                mount_point: PathBuf::from("/home"),
                options: argv(&["nodev"]),
            },
        ]
    );

    let mounted = harness(dir.path(), DiskOptions::default());
    mounted.mounter.set_mounted("/home");
    mounted.manager.setup_home_dir().await.unwrap();
    assert!(mounted.mounter.calls().is_empty());
}

#[tokio::test]
async fn test_setup_shared_memory() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), DiskOptions::default());
    h.mounter.set_mount_point("/dev/shm", "tmpfs");

    h.manager.setup_shared_memory().await.unwrap();

    assert_eq!(
        h.mounter.remounts_in_place(),
        vec![(PathBuf::from("/dev/shm"), argv(&["noexec", "nodev", "nosuid"]))]
    );
}
