//! Two-phase deployment orchestration for SD/MMC devices.
//!
//! [`MmcDeploy`] drives one provisioning run: it maps the recipe's products
//! against the user's selection into a load plan, accounts space before any
//! byte is fetched, partitions and formats the device in `prepare()`, and
//! delivers artifacts in `load()`. Every failure after partitioning begins
//! routes through rollback (sync, best-effort unmount) before the error
//! reaches the caller.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::archive;
use crate::artifact::{ArtifactRef, ArtifactSource, artifact_for_file_type, select_version};
use crate::blockdev::{PartitionExecutor, ResolvedPartition};
use crate::discover::DeviceCandidate;
use crate::error::FlashwrightError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::fstab;
use crate::interrupt::check_interrupt;
use crate::mount::MountSession;
use crate::planner::ResolvedLayout;
use crate::prompt::Prompt;
use crate::recipe::{MmcRecipe, ProductCategory, ProductKey, ProductTarget};

/// The user's product selection: category → registered-name filter.
#[derive(Debug, Default, Clone)]
pub struct ProductSelection {
    filters: BTreeMap<ProductCategory, String>,
}

impl ProductSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a category, filtering artifact names by `filter` (a regex
    /// fragment; empty matches everything).
    pub fn select(&mut self, category: ProductCategory, filter: impl Into<String>) {
        self.filters.insert(category, filter.into());
    }

    /// Returns the name filter for a requested category.
    pub fn filter(&self, category: ProductCategory) -> Option<&str> {
        self.filters.get(&category).map(String::as_str)
    }

    /// Returns true if no product was requested.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// One planned delivery: a product key, its target, and the chosen artifact.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub key: ProductKey,
    pub target: ProductTarget,
    pub artifact: ArtifactRef,
    pub expected_size: u64,
}

impl std::fmt::Debug for MmcDeploy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmcDeploy")
            .field("recipe", &self.recipe)
            .field("auto", &self.auto)
            .field("source", &"<dyn ArtifactSource>")
            .field("prompt", &"<dyn Prompt>")
            .field("executor", &"<dyn CommandExecutor>")
            .field("device", &self.device)
            .field("layout", &self.layout)
            .field("plan", &self.plan)
            .field("partitions", &self.partitions)
            .field("staging", &self.staging)
            .finish()
    }
}

/// Orchestrates one provisioning run against one device.
pub struct MmcDeploy<'a> {
    recipe: &'a MmcRecipe,
    auto: bool,
    source: &'a dyn ArtifactSource,
    prompt: &'a dyn Prompt,
    executor: Arc<dyn CommandExecutor>,
    device: DeviceCandidate,
    layout: ResolvedLayout,
    plan: Vec<PlanEntry>,
    partitions: Option<Vec<ResolvedPartition>>,
    session: MountSession,
    staging: Utf8PathBuf,
}

impl<'a> MmcDeploy<'a> {
    /// Builds the load plan and performs space accounting.
    ///
    /// Fails with [`FlashwrightError::InsufficientSpace`] before anything is
    /// fetched when the selected artifacts cannot fit their targets.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recipe: &'a MmcRecipe,
        platform: &str,
        selection: &ProductSelection,
        auto: bool,
        device: DeviceCandidate,
        layout: ResolvedLayout,
        source: &'a dyn ArtifactSource,
        prompt: &'a dyn Prompt,
        executor: Arc<dyn CommandExecutor>,
        staging: Utf8PathBuf,
    ) -> Result<Self> {
        let plan = plan_products(recipe, platform, selection, auto, source, prompt)?;
        account_space(&plan, &layout)?;

        let session = MountSession::new(executor.clone());
        Ok(Self {
            recipe,
            auto,
            source,
            prompt,
            executor,
            device,
            layout,
            plan,
            partitions: None,
            session,
            staging,
        })
    }

    /// The planned deliveries, in load order.
    pub fn plan(&self) -> &[PlanEntry] {
        &self.plan
    }

    /// Overrides the session mount root (tests mount into a scratch
    /// directory instead of /tmp).
    pub fn with_mount_root(mut self, root: Utf8PathBuf) -> Self {
        self.session = MountSession::with_root(root, self.executor.clone());
        self
    }

    /// Destructive phase: confirm, self-test, partition, format.
    pub fn prepare(&mut self) -> Result<()> {
        info!("new layout for {}:", self.device.path);
        for (index, (spec, planned)) in self
            .recipe
            .partitions
            .iter()
            .zip(&self.layout.partitions)
            .enumerate()
        {
            info!(
                "  partition {}: name: {} (size: {} bytes, fs: {})",
                index + 1,
                spec.name,
                planned.size_bytes(self.layout.sector_size),
                spec.fs_type
            );
        }

        let question = format!(
            "Do you want to continue? This will overwrite the whole device {}",
            self.device.path
        );
        if !self.prompt.confirm(&question)? {
            return Err(FlashwrightError::UserAbort.into());
        }

        let partitioner = PartitionExecutor::new(&*self.executor);
        let partitions = partitioner.execute(&self.device.path, &self.layout)?;
        self.partitions = Some(partitions);
        Ok(())
    }

    /// Delivery phase: fetch and deposit every planned product, then fstab
    /// generation, sync, and unmount.
    ///
    /// Runs against the partitions created by `prepare()`, or re-discovers
    /// them from the live device when `prepare()` was skipped. Any error or
    /// interrupt triggers rollback before being re-raised.
    pub fn load(&mut self) -> Result<()> {
        check_interrupt()?;

        if self.partitions.is_none() {
            if self.device.partitions.len() != self.recipe.partitions.len() {
                return Err(FlashwrightError::Recipe(format!(
                    "device has {} existing partition(s) but the recipe declares {}; \
                    run the prepare phase first",
                    self.device.partitions.len(),
                    self.recipe.partitions.len()
                ))
                .into());
            }
            let partitioner = PartitionExecutor::new(&*self.executor);
            self.partitions = Some(partitioner.rediscover(&self.device.path, &self.layout)?);
        }

        match self.deliver_all() {
            Ok(()) => self.finish(),
            Err(e) => {
                warn!("load failed, rolling back: {:#}", e);
                self.session.rollback();
                Err(e)
            }
        }
    }

    fn deliver_all(&mut self) -> Result<()> {
        let plan = self.plan.clone();
        let partitions = self.partitions.clone().expect("partitions resolved before delivery");
        let mut rootfs_device: Option<Utf8PathBuf> = None;

        for entry in &plan {
            check_interrupt()?;
            info!("[{}] delivering {}", entry.key.category(), entry.key);

            let local = self.fetch_verified(entry)?;
            let delivered_to = self.deliver(entry, &local, &partitions)?;

            if entry.key.category() == ProductCategory::Rootfs {
                rootfs_device = Some(delivered_to);
            }
        }

        if let Some(device) = rootfs_device {
            let mount_point = self.session.mount(&device)?;
            let entries = fstab::fstab_entries(&self.recipe.partitions, &partitions);
            fstab::write_fstab(&mount_point, &entries)?;
            self.maybe_set_root_password(&mount_point)?;
        }

        Ok(())
    }

    /// Fetches an artifact until its size matches the source-reported size.
    ///
    /// Mismatches and transport errors enter a user-confirmed retry loop;
    /// declining raises [`FlashwrightError::ArtifactFetch`].
    fn fetch_verified(&self, entry: &PlanEntry) -> Result<Utf8PathBuf> {
        loop {
            check_interrupt()?;

            let mut last_decile = 0;
            let mut report = |done: u64, total: u64| {
                if total == 0 {
                    return;
                }
                let decile = done * 10 / total;
                if decile > last_decile {
                    last_decile = decile;
                    info!("  {}%, {} of {} bytes", decile * 10, done, total);
                }
            };

            let failure = match self.source.fetch(&entry.artifact, &mut report) {
                Ok((path, size)) if size == entry.expected_size => return Ok(path),
                Ok((path, size)) => {
                    if let Err(e) = fs::remove_file(path.as_std_path()) {
                        warn!("could not remove incomplete download {}: {}", path, e);
                    }
                    format!(
                        "downloaded {} bytes but the source reports {}",
                        size, entry.expected_size
                    )
                }
                Err(e) => format!("{:#}", e),
            };

            warn!("error fetching {}: {}", entry.artifact.name, failure);
            if !self.prompt.confirm("Do you want to retry the download?")? {
                return Err(FlashwrightError::ArtifactFetch(format!(
                    "{}: {}",
                    entry.artifact.name, failure
                ))
                .into());
            }
        }
    }

    /// Deposits a fetched artifact onto its target and returns the device
    /// path it ended up on.
    fn deliver(
        &mut self,
        entry: &PlanEntry,
        local: &Utf8Path,
        partitions: &[ResolvedPartition],
    ) -> Result<Utf8PathBuf> {
        match &entry.target {
            ProductTarget::Device(index) => {
                let partition = &partitions[*index as usize];
                let mount_point = self.session.mount(&partition.path)?;

                if archive::is_tar_file(local) {
                    archive::extract_all(local, &mount_point)?;
                } else {
                    let name = local.file_name().ok_or_else(|| {
                        FlashwrightError::ArtifactFetch(format!(
                            "downloaded artifact has no file name: {}",
                            local
                        ))
                    })?;
                    let dest = mount_point.join(name);
                    info!("copying {} to {}", local, dest);
                    fs::copy(local.as_std_path(), dest.as_std_path()).map_err(|e| {
                        FlashwrightError::io(format!("failed to copy artifact to {}", dest), e)
                    })?;
                }

                Ok(partition.path.clone())
            }
            ProductTarget::Command {
                program,
                template,
                device_ref,
            } => {
                let file = if archive::is_tar_file(local) {
                    archive::extract_single_member(local, &self.staging)?
                } else {
                    local.to_owned()
                };

                let device_path = match device_ref {
                    Some(index) => partitions[*index as usize].path.clone(),
                    None => self.device.path.clone(),
                };

                let rendered = template
                    .replace("${file}", file.as_str())
                    .replace("${device}", device_path.as_str());
                let args: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
                let spec = CommandSpec::new(program.clone(), args);

                info!("executing command: {}", spec.display_line());
                let result = self.executor.execute(&spec)?;
                if !result.success() {
                    let status = result
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(FlashwrightError::Execution {
                        command: spec.display_line(),
                        status,
                    }
                    .into());
                }

                let downloaded = local.to_owned();
                for temp in [&file, &downloaded] {
                    if temp.is_file()
                        && let Err(e) = fs::remove_file(temp.as_std_path())
                    {
                        warn!("could not remove temporary file {}: {}", temp, e);
                    }
                }

                Ok(device_path)
            }
        }
    }

    /// Optionally sets a root password inside the mounted root filesystem.
    ///
    /// Interactive runs only; an empty answer skips. The hash comes from
    /// `openssl passwd -6` and is spliced into the shadow file.
    fn maybe_set_root_password(&self, rootfs_mount: &Utf8Path) -> Result<()> {
        if self.auto {
            return Ok(());
        }

        let password = self
            .prompt
            .line("Root password for the new system (empty to skip)")?;
        if password.is_empty() {
            return Ok(());
        }

        let spec = CommandSpec::new("openssl", ["passwd", "-6", password.as_str()]);
        let output = self.executor.capture(&spec)?;
        if !output.success() || output.value().is_empty() {
            return Err(FlashwrightError::Execution {
                command: "openssl passwd -6".to_string(),
                status: "could not hash the root password".to_string(),
            }
            .into());
        }

        splice_shadow(rootfs_mount, output.value())
    }

    /// Success epilogue: sync filesystems and release every mount.
    fn finish(&mut self) -> Result<()> {
        info!("syncing devices");
        let sync = CommandSpec::new("sync", Vec::<String>::new());
        let result = self.executor.execute(&sync)?;
        if !result.success() {
            warn!("sync exited with a non-zero status");
        }

        self.session.unmount_all()?;
        info!("setup of {} done", self.device.path);
        Ok(())
    }
}

/// Maps the recipe's load spec against the user's selection into a plan.
///
/// Categories are visited in the fixed load order; for each requested
/// category one build version is chosen (automatically or interactively)
/// and every recipe product of that category resolves to one artifact of
/// that version.
fn plan_products(
    recipe: &MmcRecipe,
    platform: &str,
    selection: &ProductSelection,
    auto: bool,
    source: &dyn ArtifactSource,
    prompt: &dyn Prompt,
) -> Result<Vec<PlanEntry>> {
    let mut plan = Vec::new();

    for category in ProductCategory::LOAD_ORDER {
        let Some(filter) = selection.filter(category) else {
            continue;
        };

        let keys = recipe.load.keys_in_category(category);
        if keys.is_empty() {
            warn!("product {} was requested but the recipe does not load it", category);
            continue;
        }

        let matches = source.resolve_matches(category, platform, filter)?;
        let version = select_version(&matches, auto, prompt)?;
        info!("selected {} version: {}", category, version);

        for key in keys {
            let file_type = key.file_type();
            let artifact = artifact_for_file_type(&matches, &version, file_type)
                .ok_or_else(|| {
                    FlashwrightError::ArtifactFetch(format!(
                        "version {} has no {} artifact for product {}",
                        version, file_type, key
                    ))
                })?
                .clone();
            let expected_size = source.remote_size(&artifact)?;
            let target = recipe
                .load
                .target(key)
                .expect("keys_in_category returns declared keys")
                .clone();

            plan.push(PlanEntry {
                key,
                target,
                artifact,
                expected_size,
            });
        }
    }

    Ok(plan)
}

/// Verifies every planned artifact fits its target's byte budget.
///
/// Slot 0 is the raw scratch region before the first partition (the 1 MiB
/// alignment reserve), used by command targets with no partition reference;
/// slots 1..N mirror the planned partitions.
fn account_space(plan: &[PlanEntry], layout: &ResolvedLayout) -> Result<()> {
    let mut budgets: Vec<i128> = Vec::with_capacity(layout.partitions.len() + 1);
    budgets.push(1024 * 1024);
    for partition in &layout.partitions {
        budgets.push(partition.size_bytes(layout.sector_size) as i128);
    }

    for entry in plan {
        let slot = match &entry.target {
            ProductTarget::Device(index) => *index as usize + 1,
            ProductTarget::Command {
                device_ref: Some(index),
                ..
            } => *index as usize + 1,
            ProductTarget::Command {
                device_ref: None, ..
            } => 0,
        };
        budgets[slot] -= entry.expected_size as i128;
    }

    for (slot, budget) in budgets.iter().enumerate() {
        if *budget < 0 {
            let name = if slot == 0 {
                "the device scratch area".to_string()
            } else {
                format!("partition {}", slot - 1)
            };
            return Err(FlashwrightError::InsufficientSpace {
                slot: name,
                deficit: (-budget) as u64,
            }
            .into());
        }
    }

    Ok(())
}

/// Replaces the root password hash in `<rootfs_mount>/etc/shadow`.
///
/// A missing shadow file is logged and skipped; minimal images may not
/// carry one yet.
pub(crate) fn splice_shadow(rootfs_mount: &Utf8Path, hash: &str) -> Result<()> {
    let shadow_path = rootfs_mount.join("etc/shadow");
    let content = match fs::read_to_string(shadow_path.as_std_path()) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} does not exist, skipping root password", shadow_path);
            return Ok(());
        }
        Err(e) => {
            return Err(FlashwrightError::io(format!("failed to read {}", shadow_path), e).into());
        }
    };

    let mut replaced = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if let Some(rest) = line.strip_prefix("root:") {
                let mut fields: Vec<&str> = rest.split(':').collect();
                if !fields.is_empty() {
                    fields[0] = hash;
                    replaced = true;
                    return format!("root:{}", fields.join(":"));
                }
            }
            line.to_string()
        })
        .collect();

    if !replaced {
        warn!("no root entry in {}, skipping root password", shadow_path);
        return Ok(());
    }

    fs::write(shadow_path.as_std_path(), lines.join("\n") + "\n")
        .map_err(|e| FlashwrightError::io(format!("failed to write {}", shadow_path), e))?;
    info!("root password written to {}", shadow_path);
    Ok(())
}
