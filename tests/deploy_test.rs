mod helpers;

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use flashwright::artifact::{ArtifactRef, ArtifactSource, DirectorySource, ProgressFn};
use flashwright::deploy::{MmcDeploy, ProductSelection};
use flashwright::discover::DeviceCandidate;
use flashwright::error::FlashwrightError;
use flashwright::planner::{PartitionPlanner, ResolvedLayout};
use flashwright::recipe::{MmcRecipe, ProductCategory};

use helpers::{RecordingExecutor, ScriptedPrompt, build_tar};

const RECIPE: &str = r#"
partition_table: msdos
partitions:
  - name: boot
    size: 300mb
    fs_type: fat32
    mount_point: /boot
    mount_opts: defaults
    flags: [boot]
  - name: root
    size: max
    fs_type: ext4
    mount_point: /
    mount_opts: defaults
load:
  Linux_Boot:
    device: 0
  Rootfs_Rootfs:
    device: 1
  Uboot:
    command: dd if=${file} of=${device} bs=512 seek=2
"#;

struct Fixture {
    _temp: tempfile::TempDir,
    recipe: MmcRecipe,
    layout: ResolvedLayout,
    device: DeviceCandidate,
    artifact_root: Utf8PathBuf,
    staging: Utf8PathBuf,
    mount_root: Utf8PathBuf,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    let artifact_root = base.join("artifacts");
    let staging = base.join("staging");
    let mount_root = base.join("mounts");
    for dir in [&staging, &mount_root] {
        std::fs::create_dir_all(dir).unwrap();
    }

    // Two build versions; auto mode must pick build-03.
    let rootfs_dir = artifact_root.join("rootfs/bbb");
    std::fs::create_dir_all(&rootfs_dir).unwrap();
    build_tar(
        &rootfs_dir.join("build-01_rootfs.tar"),
        &[("etc/hostname", b"old\n")],
    );
    build_tar(
        &rootfs_dir.join("build-03_rootfs.tar"),
        &[
            ("etc/hostname", b"bbb\n"),
            ("etc/shadow", b"root:*:17000:0:99999:7:::\n"),
        ],
    );

    let linux_dir = artifact_root.join("linux/bbb");
    std::fs::create_dir_all(&linux_dir).unwrap();
    std::fs::write(linux_dir.join("build-03_boot.img").as_std_path(), b"zImage-bytes").unwrap();

    let uboot_dir = artifact_root.join("uboot/bbb");
    std::fs::create_dir_all(&uboot_dir).unwrap();
    build_tar(&uboot_dir.join("build-03_uboot.tar"), &[("u-boot.sb", b"spl-bytes")]);

    let recipe: MmcRecipe = serde_yaml::from_str(RECIPE).unwrap();
    let planner = PartitionPlanner::with_probe(|_| true);
    let layout = planner.resolve(&recipe, 4096 * 1024 * 1024, 512).unwrap();

    // A regular file stands in for the raw device node; the integrity
    // self-test reads and writes it like a device, everything else is mocked.
    let device_path = base.join("mmcblk0");
    std::fs::write(device_path.as_std_path(), []).unwrap();

    let device = DeviceCandidate {
        name: "mmcblk0".to_string(),
        path: device_path,
        size_bytes: 4096 * 1024 * 1024,
        table_type: None,
        partitions: vec![],
    };

    Fixture {
        _temp: temp,
        recipe,
        layout,
        device,
        artifact_root,
        staging,
        mount_root,
    }
}

fn full_selection() -> ProductSelection {
    let mut selection = ProductSelection::new();
    selection.select(ProductCategory::Rootfs, "");
    selection.select(ProductCategory::Uboot, "");
    selection.select(ProductCategory::Linux, "");
    selection
}

#[test]
fn prepare_and_load_provision_the_device_end_to_end() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    let prompt = ScriptedPrompt::new(["y"]);
    let source =
        DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone()).unwrap();

    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &full_selection(),
        true,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor.clone(),
        fixture.staging.clone(),
    )
    .unwrap()
    .with_mount_root(fixture.mount_root.clone());

    // The plan follows the fixed category order and picks the newest build.
    let planned: Vec<&str> = deploy.plan().iter().map(|e| e.artifact.name.as_str()).collect();
    assert_eq!(
        planned,
        vec!["build-03_rootfs.tar", "build-03_uboot.tar", "build-03_boot.img"]
    );

    deploy.prepare().unwrap();
    deploy.load().unwrap();

    let names = executor.command_names();

    // Destructive phase: fresh table, two partitions, the boot flag, then
    // formatting with labels.
    assert_eq!(names.iter().filter(|n| *n == "parted").count(), 4);
    assert_eq!(names.iter().filter(|n| *n == "mkfs.fat").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "mkfs.ext4").count(), 1);

    // Rootfs is delivered first: the first mount is the root partition.
    let first_mount = executor
        .calls()
        .into_iter()
        .find(|call| call[0] == "mount")
        .unwrap();
    assert!(first_mount[1].contains("mmcblk0p2"));

    // The rootfs tarball was extracted onto the mounted partition.
    let root_mount = fixture.mount_root.join("mmcblk0p2");
    let hostname = std::fs::read_to_string(root_mount.join("etc/hostname").as_std_path()).unwrap();
    assert_eq!(hostname, "bbb\n");

    // The kernel image is a plain file and was copied, not extracted.
    let boot_mount = fixture.mount_root.join("mmcblk0p1");
    let kernel = std::fs::read(boot_mount.join("build-03_boot.img").as_std_path()).unwrap();
    assert_eq!(kernel, b"zImage-bytes");

    // The u-boot command ran against the raw device with the extracted
    // archive member, and the temporary file is gone.
    let dd_call = executor.calls().into_iter().find(|call| call[0] == "dd").unwrap();
    let raw_target = format!("of={}", fixture.device.path);
    assert!(dd_call.iter().any(|arg| *arg == raw_target));
    assert!(dd_call.iter().any(|arg| arg.starts_with("if=") && arg.ends_with("u-boot.sb")));
    assert!(dd_call.iter().any(|arg| arg == "seek=2"));
    assert!(!fixture.staging.join("u-boot.sb").exists());

    // fstab was generated inside the rootfs mount from the recipe specs.
    let fstab = std::fs::read_to_string(root_mount.join("etc/fstab").as_std_path()).unwrap();
    assert!(fstab.contains("/boot\tfat32\tdefaults\t0\t0"));
    assert!(fstab.contains("/\text4\tdefaults\t0\t0"));
    assert!(fstab.contains("UUID="), "fstab should reference filesystem UUIDs");

    // Success epilogue: sync, then both partitions unmounted.
    assert!(names.contains(&"sync".to_string()));
    assert_eq!(names.iter().filter(|n| *n == "umount").count(), 2);
}

#[test]
fn declined_confirmation_aborts_before_any_destructive_command() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    let prompt = ScriptedPrompt::new([""]);
    let source =
        DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone()).unwrap();

    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &full_selection(),
        true,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor.clone(),
        fixture.staging.clone(),
    )
    .unwrap();

    let err = deploy.prepare().unwrap_err();
    let downcast = err.downcast_ref::<FlashwrightError>().unwrap();
    assert!(matches!(downcast, FlashwrightError::UserAbort));
    assert!(executor.calls().is_empty(), "no command may run before confirmation");
}

#[test]
fn load_without_prepare_requires_matching_existing_partitions() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    let prompt = ScriptedPrompt::new(Vec::<String>::new());
    let source =
        DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone()).unwrap();

    // The candidate reports no existing partitions; the recipe wants two.
    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &full_selection(),
        true,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor,
        fixture.staging.clone(),
    )
    .unwrap();

    let err = deploy.load().unwrap_err();
    assert!(err.to_string().contains("existing partition"));
}

#[test]
fn load_reuses_existing_partitions_when_counts_match() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    let prompt = ScriptedPrompt::new(Vec::<String>::new());
    let source =
        DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone()).unwrap();

    let mut device = fixture.device.clone();
    device.partitions = vec![
        Utf8PathBuf::from("/dev/mmcblk0p1"),
        Utf8PathBuf::from("/dev/mmcblk0p2"),
    ];

    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &full_selection(),
        true,
        device,
        fixture.layout.clone(),
        &source,
        &prompt,
        executor.clone(),
        fixture.staging.clone(),
    )
    .unwrap()
    .with_mount_root(fixture.mount_root.clone());

    deploy.load().unwrap();

    let names = executor.command_names();
    assert!(!names.contains(&"parted".to_string()), "load-only must not repartition");
    assert!(!names.iter().any(|n| n.starts_with("mkfs")), "load-only must not format");
    assert!(names.contains(&"mount".to_string()));
}

/// Source whose reported size never matches what fetch delivers.
struct LyingSource {
    inner: DirectorySource,
    fetches: std::sync::atomic::AtomicUsize,
}

impl ArtifactSource for LyingSource {
    fn list_builds(
        &self,
        platform: &str,
    ) -> Result<std::collections::BTreeMap<ProductCategory, Vec<String>>> {
        self.inner.list_builds(platform)
    }

    fn resolve_matches(
        &self,
        category: ProductCategory,
        platform: &str,
        name_filter: &str,
    ) -> Result<Vec<ArtifactRef>> {
        self.inner.resolve_matches(category, platform, name_filter)
    }

    fn remote_size(&self, artifact: &ArtifactRef) -> Result<u64> {
        Ok(self.inner.remote_size(artifact)? + 1)
    }

    fn fetch(&self, artifact: &ArtifactRef, progress: ProgressFn) -> Result<(Utf8PathBuf, u64)> {
        self.fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.fetch(artifact, progress)
    }
}

#[test]
fn size_mismatch_retries_then_fails_when_the_user_declines() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    // prepare confirm, one retry confirm, then decline.
    let prompt = ScriptedPrompt::new(["y", "y", "n"]);
    let source = LyingSource {
        inner: DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone())
            .unwrap(),
        fetches: std::sync::atomic::AtomicUsize::new(0),
    };

    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &full_selection(),
        true,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor.clone(),
        fixture.staging.clone(),
    )
    .unwrap()
    .with_mount_root(fixture.mount_root.clone());

    deploy.prepare().unwrap();
    let err = deploy.load().unwrap_err();

    let downcast = err.downcast_ref::<FlashwrightError>().unwrap();
    assert!(matches!(downcast, FlashwrightError::ArtifactFetch(_)));

    // One initial attempt plus one user-confirmed retry; the artifact was
    // never delivered anywhere.
    assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(!executor.command_names().contains(&"mount".to_string()));

    // Rollback ran: the failure path syncs before re-raising.
    assert!(executor.command_names().contains(&"sync".to_string()));
}

#[test]
fn oversized_selection_fails_before_any_fetch() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    let prompt = ScriptedPrompt::new(Vec::<String>::new());

    // An artifact larger than the 1 MiB scratch budget of the raw-device
    // command target.
    let uboot_dir = fixture.artifact_root.join("uboot/bbb");
    std::fs::write(
        uboot_dir.join("build-09_uboot.img").as_std_path(),
        vec![0u8; 2 * 1024 * 1024],
    )
    .unwrap();

    let source = LyingSource {
        inner: DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone())
            .unwrap(),
        fetches: std::sync::atomic::AtomicUsize::new(0),
    };

    let mut selection = ProductSelection::new();
    selection.select(ProductCategory::Uboot, "build-09");

    let err = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &selection,
        true,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor,
        fixture.staging.clone(),
    )
    .unwrap_err();

    let downcast = err.downcast_ref::<FlashwrightError>().unwrap();
    assert!(matches!(downcast, FlashwrightError::InsufficientSpace { .. }));
    assert_eq!(
        source.fetches.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "space accounting must reject the plan before any download"
    );
}

#[test]
fn interactive_run_writes_the_root_password() {
    let fixture = fixture();
    let executor = Arc::new(RecordingExecutor::new());
    // prepare confirm, then the password line.
    let prompt = ScriptedPrompt::new(["y", "hunter2"]);
    let source =
        DirectorySource::new(fixture.artifact_root.clone(), fixture.staging.clone()).unwrap();

    let mut selection = ProductSelection::new();
    selection.select(ProductCategory::Rootfs, "build-03");

    let mut deploy = MmcDeploy::new(
        &fixture.recipe,
        "bbb",
        &selection,
        false,
        fixture.device.clone(),
        fixture.layout.clone(),
        &source,
        &prompt,
        executor.clone(),
        fixture.staging.clone(),
    )
    .unwrap()
    .with_mount_root(fixture.mount_root.clone());

    deploy.prepare().unwrap();
    deploy.load().unwrap();

    let shadow = std::fs::read_to_string(
        fixture.mount_root.join("mmcblk0p2/etc/shadow").as_std_path(),
    )
    .unwrap();
    assert!(shadow.starts_with("root:$6$testsalt$testhash:"));
}
