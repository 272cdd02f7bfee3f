//! Partition layout planning.
//!
//! The planner validates a partition table specification against the host
//! (formatting tools present, flags known to the backend) and resolves the
//! symbolic sizes into concrete sector runs. All arithmetic happens here;
//! the executor applies the resolved layout verbatim.

use which::which;

use crate::error::FlashwrightError;
use crate::recipe::{FsType, MmcRecipe, PartSize, TableFormat};

/// One mebibyte, the alignment grain for all partitions.
const MIB: u64 = 1024 * 1024;

/// Partition flags the parted backend understands.
const KNOWN_FLAGS: &[&str] = &[
    "boot",
    "root",
    "swap",
    "hidden",
    "raid",
    "lvm",
    "lba",
    "legacy_boot",
    "bios_grub",
    "esp",
    "msftdata",
    "msftres",
    "prep",
    "diag",
    "palo",
    "irst",
];

/// A partition resolved to a concrete sector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub name: String,
    pub fs_type: FsType,
    pub flags: Vec<String>,
    /// First sector of the partition.
    pub start_sector: u64,
    /// Length in sectors.
    pub sector_count: u64,
}

impl PlannedPartition {
    /// Size of the partition in bytes, given the layout's sector size.
    pub fn size_bytes(&self, sector_size: u64) -> u64 {
        self.sector_count * sector_size
    }
}

/// A fully resolved partition layout, ready for the executor.
#[derive(Debug, Clone)]
pub struct ResolvedLayout {
    pub table: TableFormat,
    pub sector_size: u64,
    pub partitions: Vec<PlannedPartition>,
}

/// Validates table specifications and resolves them against a device.
pub struct PartitionPlanner {
    tool_probe: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl Default for PartitionPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionPlanner {
    /// Creates a planner that probes formatting tools on `PATH`.
    pub fn new() -> Self {
        Self {
            tool_probe: Box::new(|tool| which(tool).is_ok()),
        }
    }

    /// Creates a planner with a custom tool probe (used by tests).
    pub fn with_probe(probe: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            tool_probe: Box::new(probe),
        }
    }

    /// Validates the recipe against the host environment.
    ///
    /// Re-runs the structural checks first so a planner used standalone
    /// still rejects malformed tables, then verifies each filesystem's
    /// formatting tool is available and each flag is one the backend knows.
    pub fn validate(&self, recipe: &MmcRecipe) -> Result<(), FlashwrightError> {
        recipe.validate()?;

        for spec in &recipe.partitions {
            let tool = spec.fs_type.mkfs_tool();
            if !(self.tool_probe)(tool) {
                return Err(FlashwrightError::UnsupportedFilesystem {
                    fs_type: spec.fs_type.to_string(),
                    tool: tool.to_string(),
                });
            }

            for flag in &spec.flags {
                if !KNOWN_FLAGS.contains(&flag.as_str()) {
                    return Err(FlashwrightError::InvalidFlag {
                        flag: flag.clone(),
                        partition: spec.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Validates and resolves the table against a concrete device.
    ///
    /// The free-space cursor starts one grain (1 MiB) into the device,
    /// leaving room for the partition table, and every partition begins and
    /// ends on a grain boundary. Percentages consume their share of the free
    /// space remaining at that point, not of the whole device.
    pub fn resolve(
        &self,
        recipe: &MmcRecipe,
        device_capacity_bytes: u64,
        sector_size: u64,
    ) -> Result<ResolvedLayout, FlashwrightError> {
        self.validate(recipe)?;

        if sector_size == 0 || MIB % sector_size != 0 {
            return Err(FlashwrightError::Recipe(format!(
                "sector size {} does not divide the 1 MiB alignment grain",
                sector_size
            )));
        }

        let grain = MIB / sector_size;
        let total_sectors = device_capacity_bytes / sector_size;
        // Last usable sector boundary, rounded down to the grain.
        let usable_end = (total_sectors / grain) * grain;
        let mut cursor = grain;

        let mut partitions = Vec::with_capacity(recipe.partitions.len());

        for spec in &recipe.partitions {
            let remaining = usable_end.saturating_sub(cursor);

            let sector_count = match spec.size {
                PartSize::Bytes(bytes) => {
                    let sectors = bytes.div_ceil(sector_size);
                    sectors.div_ceil(grain) * grain
                }
                PartSize::Percent(fraction) => {
                    let sectors = (remaining as f64 * fraction).floor() as u64;
                    (sectors / grain) * grain
                }
                PartSize::Max => remaining,
            };

            if sector_count == 0 || sector_count > remaining {
                return Err(FlashwrightError::Recipe(format!(
                    "partition {} ({}) does not fit in the {} free sectors remaining on the device",
                    spec.name, spec.size, remaining
                )));
            }

            partitions.push(PlannedPartition {
                name: spec.name.clone(),
                fs_type: spec.fs_type,
                flags: spec.flags.clone(),
                start_sector: cursor,
                sector_count,
            });
            cursor += sector_count;
        }

        Ok(ResolvedLayout {
            table: recipe.partition_table,
            sector_size,
            partitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{LoadSpec, PartitionSpec};

    fn spec(name: &str, size: PartSize, fs_type: FsType, flags: &[&str]) -> PartitionSpec {
        PartitionSpec {
            name: name.to_string(),
            size,
            fs_type,
            mount_point: "/".to_string(),
            mount_opts: "defaults".to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn recipe(partitions: Vec<PartitionSpec>) -> MmcRecipe {
        MmcRecipe {
            partition_table: TableFormat::Msdos,
            partitions,
            load: LoadSpec::default(),
        }
    }

    fn permissive_planner() -> PartitionPlanner {
        PartitionPlanner::with_probe(|_| true)
    }

    #[test]
    fn missing_mkfs_tool_is_unsupported_filesystem() {
        let planner = PartitionPlanner::with_probe(|tool| tool != "mkfs.btrfs");
        let recipe = recipe(vec![spec("DATA", PartSize::Max, FsType::Btrfs, &[])]);

        let err = planner.validate(&recipe).unwrap_err();
        assert!(matches!(
            err,
            FlashwrightError::UnsupportedFilesystem { tool, .. } if tool == "mkfs.btrfs"
        ));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let planner = permissive_planner();
        let recipe = recipe(vec![spec("BOOT", PartSize::Max, FsType::Fat32, &["bootable"])]);

        let err = planner.validate(&recipe).unwrap_err();
        assert!(matches!(
            err,
            FlashwrightError::InvalidFlag { flag, partition }
                if flag == "bootable" && partition == "BOOT"
        ));
    }

    #[test]
    fn known_flags_pass_validation() {
        let planner = permissive_planner();
        let recipe = recipe(vec![spec("BOOT", PartSize::Max, FsType::Fat32, &["boot", "lba"])]);
        assert!(planner.validate(&recipe).is_ok());
    }

    #[test]
    fn boot_plus_max_layout_on_4096_mib_device() {
        let planner = permissive_planner();
        let recipe = recipe(vec![
            spec("BOOT", PartSize::Bytes(300 * 1024 * 1024), FsType::Fat32, &[]),
            spec("ROOT", PartSize::Max, FsType::Ext4, &[]),
        ]);

        let layout = planner.resolve(&recipe, 4096 * 1024 * 1024, 512).unwrap();
        let grain = 2048; // sectors per MiB at 512-byte sectors

        let boot = &layout.partitions[0];
        assert_eq!(boot.start_sector, grain);
        assert_eq!(boot.sector_count, 300 * grain);

        // ROOT gets everything after BOOT and the 1 MiB alignment reserve.
        let root = &layout.partitions[1];
        assert_eq!(root.start_sector, grain + 300 * grain);
        assert_eq!(root.sector_count, (4096 - 301) * grain);
    }

    #[test]
    fn resolved_ranges_are_disjoint_ordered_and_within_capacity() {
        let planner = permissive_planner();
        let recipe = recipe(vec![
            spec("A", PartSize::Bytes(64 * 1024 * 1024), FsType::Ext2, &[]),
            spec("B", PartSize::Percent(0.5), FsType::Ext3, &[]),
            spec("C", PartSize::Max, FsType::Ext4, &[]),
        ]);

        let capacity = 1024 * 1024 * 1024;
        let layout = planner.resolve(&recipe, capacity, 512).unwrap();

        let mut previous_end = 0;
        let mut total = 0;
        for part in &layout.partitions {
            assert!(part.start_sector >= previous_end, "ranges must be ordered and disjoint");
            previous_end = part.start_sector + part.sector_count;
            total += part.sector_count;
        }
        assert!(total * 512 <= capacity);
    }

    #[test]
    fn percentage_is_evaluated_against_remaining_free_space() {
        let planner = permissive_planner();
        let recipe = recipe(vec![
            spec("A", PartSize::Bytes(512 * 1024 * 1024), FsType::Ext4, &[]),
            spec("B", PartSize::Percent(0.5), FsType::Ext4, &[]),
            spec("C", PartSize::Max, FsType::Ext4, &[]),
        ]);

        let layout = planner.resolve(&recipe, 1024 * 1024 * 1024, 512).unwrap();
        let grain = 2048;

        // After A (512 MiB) and the reserve, 511 MiB remain; B takes half,
        // rounded down to the grain.
        let b = &layout.partitions[1];
        assert_eq!(b.sector_count, (511 * grain / 2 / grain) * grain);
    }

    #[test]
    fn byte_sizes_round_up_to_the_grain() {
        let planner = permissive_planner();
        let recipe = recipe(vec![
            spec("A", PartSize::Bytes(1), FsType::Ext4, &[]),
            spec("B", PartSize::Max, FsType::Ext4, &[]),
        ]);

        let layout = planner.resolve(&recipe, 64 * 1024 * 1024, 512).unwrap();
        assert_eq!(layout.partitions[0].sector_count, 2048);
    }

    #[test]
    fn oversized_partition_is_rejected() {
        let planner = permissive_planner();
        let recipe = recipe(vec![spec(
            "HUGE",
            PartSize::Bytes(8 * 1024 * 1024 * 1024),
            FsType::Ext4,
            &[],
        )]);

        let err = planner.resolve(&recipe, 4096 * 1024 * 1024, 512).unwrap_err();
        assert!(err.to_string().contains("HUGE"));
    }

    #[test]
    fn four_kib_sectors_scale_the_grain() {
        let planner = permissive_planner();
        let recipe = recipe(vec![spec("A", PartSize::Max, FsType::Ext4, &[])]);

        let layout = planner.resolve(&recipe, 1024 * 1024 * 1024, 4096).unwrap();
        let grain = 256; // sectors per MiB at 4 KiB sectors
        assert_eq!(layout.partitions[0].start_sector, grain);
        assert_eq!(layout.partitions[0].sector_count, (1024 - 1) * grain);
    }

    #[test]
    fn weird_sector_size_is_rejected() {
        let planner = permissive_planner();
        let recipe = recipe(vec![spec("A", PartSize::Max, FsType::Ext4, &[])]);
        assert!(planner.resolve(&recipe, 1 << 30, 1000).is_err());
        assert!(planner.resolve(&recipe, 1 << 30, 0).is_err());
    }
}
