pub mod archive;
pub mod artifact;
pub mod blockdev;
pub mod cli;
pub mod deploy;
pub mod discover;
pub mod error;
pub mod executor;
pub mod fstab;
pub mod interrupt;
pub mod mount;
pub mod planner;
pub mod prompt;
pub mod recipe;
pub mod size;
pub mod sysfs;
pub mod uevent;

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};
use uuid::Uuid;

use crate::artifact::DirectorySource;
use crate::deploy::{MmcDeploy, ProductSelection};
use crate::discover::DeviceCandidate;
use crate::error::FlashwrightError;
use crate::executor::{CommandExecutor, RealCommandExecutor};
use crate::planner::PartitionPlanner;
use crate::prompt::{ConsolePrompt, Prompt};
use crate::recipe::{ProductCategory, Recipe};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Builds the product selection from the setup flags.
fn build_selection(opts: &cli::SetupArgs) -> ProductSelection {
    let mut selection = ProductSelection::new();
    let flags = [
        (ProductCategory::Rootfs, &opts.rootfs),
        (ProductCategory::Uboot, &opts.uboot),
        (ProductCategory::Linux, &opts.linux),
        (ProductCategory::Misc, &opts.misc),
    ];
    for (category, filter) in flags {
        if let Some(filter) = filter {
            selection.select(category, filter.clone());
        }
    }
    selection
}

/// Waits for a card insertion and returns the chosen device.
fn pick_device(
    prompt: &dyn Prompt,
    executor: &dyn CommandExecutor,
    auto: bool,
) -> Result<DeviceCandidate> {
    prompt.line("Please remove the card first, then press enter")?;
    println!("Searching for the card. Please insert it now...");

    let sysfs_root = Utf8Path::new(sysfs::SYSFS_BLOCK_ROOT);
    let mut events = uevent::UeventSource::open()?;
    let names =
        discover::discover(&mut events, |name| sysfs::device_size_bytes(sysfs_root, name))?;
    let candidates = discover::inspect_candidates(&names, sysfs_root, executor);

    println!("Found these devices:");
    let items: Vec<String> = candidates
        .iter()
        .map(|candidate| {
            format!(
                "{} (size: {} MB, table: {}, {} partition(s))",
                candidate.path,
                candidate.size_bytes / (1024 * 1024),
                candidate.table_type.as_deref().unwrap_or("none"),
                candidate.partitions.len()
            )
        })
        .collect();
    for (index, item) in items.iter().enumerate() {
        println!("{}: {}", index, item);
    }

    let index = if candidates.len() > 1 {
        prompt.select("Please select a device to continue", &items)?
    } else {
        0
    };
    let device = candidates[index].clone();

    if !auto && !prompt.confirm("Do you want to continue with the setup process?")? {
        return Err(FlashwrightError::UserAbort.into());
    }

    Ok(device)
}

pub fn run_setup(opts: &cli::SetupArgs) -> Result<()> {
    let file = recipe::load_recipe_file(&opts.recipe)
        .with_context(|| format!("failed to load recipe from {}", opts.recipe))?;
    if file.platform.platform != opts.platform {
        return Err(FlashwrightError::Recipe(format!(
            "recipe declares platform {:?} but {:?} was requested",
            file.platform.platform, opts.platform
        ))
        .into());
    }

    let selection = build_selection(opts);
    if selection.is_empty() && !opts.prepare_only {
        return Err(FlashwrightError::Recipe(
            "no products selected; pass at least one of -r/-u/-l/-m, or --prepare-only \
            to only partition the card"
                .to_string(),
        )
        .into());
    }

    interrupt::install_interrupt_flag()?;
    interrupt::clear_interrupt();

    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor { dry_run: false });
    let prompt = ConsolePrompt;

    let device = pick_device(&prompt, &*executor, opts.auto)?;
    blockdev::ensure_writable(&device.path)?;
    blockdev::ensure_unmounted(&*executor, &device.partitions, Utf8Path::new("/proc/mounts"))?;

    let staging = Utf8PathBuf::from(format!("/tmp/flashwright-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&staging)
        .map_err(|e| FlashwrightError::io(format!("failed to create {}", staging), e))?;
    let source = DirectorySource::new(opts.artifact_dir.clone(), staging.clone())?;

    let sysfs_root = Utf8Path::new(sysfs::SYSFS_BLOCK_ROOT);
    let sector_size = sysfs::logical_sector_size(sysfs_root, &device.name);
    let planner = PartitionPlanner::new();

    for document in &file.recipes {
        let Recipe::Mmc { recipe } = document;

        let layout = planner.resolve(recipe, device.size_bytes, sector_size)?;
        let mut deploy = MmcDeploy::new(
            recipe,
            &opts.platform,
            &selection,
            opts.auto,
            device.clone(),
            layout,
            &source,
            &prompt,
            executor.clone(),
            staging.clone(),
        )?;

        if !opts.load_only {
            deploy.prepare()?;
        }
        if !opts.prepare_only {
            deploy.load()?;
        }
    }

    info!("platform {} provisioned successfully", opts.platform);
    Ok(())
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let file = recipe::load_recipe_file(&opts.recipe)
        .with_context(|| format!("failed to load recipe from {}", opts.recipe))?;

    let planner = PartitionPlanner::new();
    for document in &file.recipes {
        let Recipe::Mmc { recipe } = document;
        planner.validate(recipe)?;
    }

    info!(
        "validation successful: platform {} with {} recipe document(s)",
        file.platform.platform,
        file.recipes.len()
    );
    Ok(())
}
