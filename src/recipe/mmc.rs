//! SD/MMC recipe payload: partition table specification and load mapping.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::de::{self, Deserializer};
use strum::{Display, EnumString};

use crate::error::FlashwrightError;
use crate::size::parse_size;

/// Partition table formats the backend can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TableFormat {
    Msdos,
    Gpt,
}

impl TableFormat {
    /// Returns true if the format stores per-partition names.
    pub fn supports_partition_names(&self) -> bool {
        match self {
            TableFormat::Msdos => false,
            TableFormat::Gpt => true,
        }
    }
}

impl<'de> Deserialize<'de> for TableFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| {
            de::Error::custom(FlashwrightError::UnsupportedTableFormat(raw).to_string())
        })
    }
}

/// Filesystem types with a known formatting tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Fat32,
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
}

impl FsType {
    /// The mkfs tool for this filesystem type.
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            FsType::Fat32 => "mkfs.fat",
            FsType::Ext2 => "mkfs.ext2",
            FsType::Ext3 => "mkfs.ext3",
            FsType::Ext4 => "mkfs.ext4",
            FsType::Btrfs => "mkfs.btrfs",
        }
    }

    /// Arguments for formatting `device`, with the label as the volume name
    /// when one is given.
    pub fn mkfs_args(&self, label: Option<&str>, device: &str) -> Vec<String> {
        let (force_flag, label_flag) = match self {
            FsType::Fat32 => ("-F32", "-n"),
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => ("-F", "-L"),
            FsType::Btrfs => ("-f", "-L"),
        };

        let mut args = vec![force_flag.to_string()];
        if let Some(label) = label {
            args.push(label_flag.to_string());
            args.push(label.to_string());
        }
        args.push(device.to_string());
        args
    }

    /// The filesystem type name `parted mkpart` understands.
    pub fn parted_name(&self) -> &'static str {
        match self {
            FsType::Fat32 => "fat32",
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Btrfs => "btrfs",
        }
    }
}

impl<'de> Deserialize<'de> for FsType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| {
            de::Error::custom(format!(
                "filesystem type {:?} is not supported (known: fat32, ext2, ext3, ext4, btrfs)",
                raw
            ))
        })
    }
}

/// A partition size as written in the recipe.
///
/// `Percent` is evaluated against the free space remaining when the
/// partition is planned, not against the whole device. `Max` may only appear
/// on the last partition of a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartSize {
    Bytes(u64),
    Percent(f64),
    Max,
}

impl fmt::Display for PartSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSize::Bytes(n) => write!(f, "{} bytes", n),
            PartSize::Percent(p) => write!(f, "{}%", (p * 100.0).round() as u64),
            PartSize::Max => f.write_str("max"),
        }
    }
}

impl<'de> Deserialize<'de> for PartSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = PartSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a size string (bytes, kb/mb/gb/tb suffix, NN%, or max)")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(PartSize::Bytes(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let trimmed = v.trim();
                if trimmed.eq_ignore_ascii_case("max") {
                    return Ok(PartSize::Max);
                }
                if let Some(number) = trimmed.strip_suffix('%') {
                    let percent: u64 = number
                        .trim()
                        .parse()
                        .map_err(|_| de::Error::custom(format!("invalid percentage: {:?}", v)))?;
                    if percent == 0 || percent > 100 {
                        return Err(de::Error::custom(format!(
                            "percentage must range between 1% and 100%, got {:?}",
                            v
                        )));
                    }
                    return Ok(PartSize::Percent(percent as f64 / 100.0));
                }
                parse_size(trimmed)
                    .map(PartSize::Bytes)
                    .map_err(|e| de::Error::custom(e.to_string()))
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

fn deserialize_partition_name<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let name = raw.trim().to_uppercase();
    if name.is_empty() {
        return Err(de::Error::custom("partition must contain a name"));
    }
    Ok(name)
}

/// One partition of the table, as declared in the recipe.
///
/// Names are upper-cased and trimmed on load; they become volume labels and
/// (on gpt) partition names.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    #[serde(deserialize_with = "deserialize_partition_name")]
    pub name: String,
    pub size: PartSize,
    pub fs_type: FsType,
    pub mount_point: String,
    #[serde(default = "default_mount_opts")]
    pub mount_opts: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

fn default_mount_opts() -> String {
    "defaults".to_string()
}

/// Product categories, in their fixed load-priority order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProductCategory {
    Rootfs,
    Uboot,
    Linux,
    Misc,
}

impl ProductCategory {
    /// The fixed delivery order for `load()`.
    pub const LOAD_ORDER: [ProductCategory; 4] = [
        ProductCategory::Rootfs,
        ProductCategory::Uboot,
        ProductCategory::Linux,
        ProductCategory::Misc,
    ];
}

/// Product keys a load mapping may declare.
///
/// The YAML spelling matches the variant name exactly (`Rootfs_Rootfs`,
/// `Linux_Boot`, ...), which is why these are not camel case.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Display)]
pub enum ProductKey {
    Rootfs_Rootfs,
    Rootfs_Portage,
    Linux_Root,
    Linux_Boot,
    Linux_Config,
    Uboot,
    Misc_Root,
    Misc_Boot,
}

impl ProductKey {
    /// The product category this key belongs to.
    pub fn category(&self) -> ProductCategory {
        match self {
            ProductKey::Rootfs_Rootfs | ProductKey::Rootfs_Portage => ProductCategory::Rootfs,
            ProductKey::Linux_Root | ProductKey::Linux_Boot | ProductKey::Linux_Config => {
                ProductCategory::Linux
            }
            ProductKey::Uboot => ProductCategory::Uboot,
            ProductKey::Misc_Root | ProductKey::Misc_Boot => ProductCategory::Misc,
        }
    }

    /// The artifact file type this key selects within its category.
    pub fn file_type(&self) -> &'static str {
        match self {
            ProductKey::Rootfs_Rootfs => "rootfs",
            ProductKey::Rootfs_Portage => "portage",
            ProductKey::Linux_Root | ProductKey::Misc_Root => "root",
            ProductKey::Linux_Boot | ProductKey::Misc_Boot => "boot",
            ProductKey::Linux_Config => "config",
            ProductKey::Uboot => "uboot",
        }
    }
}

/// Where a product's artifact is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductTarget {
    /// Index into the planned partition list.
    Device(u32),
    /// A command template executed with `${file}` and `${device}`
    /// substituted. `device_ref` names the partition index the command
    /// writes to; `None` means the whole raw device.
    Command {
        program: String,
        template: String,
        device_ref: Option<u32>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    device: Option<u32>,
    command: Option<String>,
    device_ref: Option<u32>,
}

impl<'de> Deserialize<'de> for ProductTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTarget::deserialize(deserializer)?;
        match (raw.device, raw.command) {
            (Some(index), None) => {
                if raw.device_ref.is_some() {
                    return Err(de::Error::custom(
                        "device_ref is only meaningful for command targets",
                    ));
                }
                Ok(ProductTarget::Device(index))
            }
            (None, Some(command)) => {
                let mut words = command.split_whitespace();
                let program = words
                    .next()
                    .ok_or_else(|| de::Error::custom("command must not be empty"))?
                    .to_string();
                let template = words.collect::<Vec<_>>().join(" ");
                Ok(ProductTarget::Command {
                    program,
                    template,
                    device_ref: raw.device_ref,
                })
            }
            _ => Err(de::Error::custom(
                "product target must state exactly one of device or command",
            )),
        }
    }
}

/// Mapping from product keys to their delivery targets.
///
/// Keys with an explicit `~` (null) value are treated as absent, so a recipe
/// can list every known key and only fill in the relevant ones.
#[derive(Debug, Default)]
pub struct LoadSpec {
    targets: BTreeMap<ProductKey, ProductTarget>,
}

impl LoadSpec {
    /// Iterates over the declared products in key order.
    pub fn products(&self) -> impl Iterator<Item = (ProductKey, &ProductTarget)> {
        self.targets.iter().map(|(key, target)| (*key, target))
    }

    /// Returns the target for a product key, if declared.
    pub fn target(&self, key: ProductKey) -> Option<&ProductTarget> {
        self.targets.get(&key)
    }

    /// Returns the declared keys belonging to a category, in key order.
    pub fn keys_in_category(&self, category: ProductCategory) -> Vec<ProductKey> {
        self.targets
            .keys()
            .copied()
            .filter(|key| key.category() == category)
            .collect()
    }

    /// Returns true if no product is declared.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<(ProductKey, ProductTarget)>) -> Self {
        Self {
            targets: entries.into_iter().collect(),
        }
    }
}

impl<'de> Deserialize<'de> for LoadSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: BTreeMap<ProductKey, Option<ProductTarget>> =
            BTreeMap::deserialize(deserializer)?;
        Ok(Self {
            targets: raw
                .into_iter()
                .filter_map(|(key, target)| target.map(|t| (key, t)))
                .collect(),
        })
    }
}

/// The `mmc` recipe payload: partition table plus load mapping.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MmcRecipe {
    pub partition_table: TableFormat,
    pub partitions: Vec<PartitionSpec>,
    pub load: LoadSpec,
}

impl MmcRecipe {
    /// Structural validation, performed at parse time before any hardware is
    /// touched: unique names, `max` only on the last partition, and load
    /// targets referencing partitions that exist.
    pub fn validate(&self) -> Result<(), FlashwrightError> {
        if self.partitions.is_empty() {
            return Err(FlashwrightError::Recipe(
                "partition table declares no partitions".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for spec in &self.partitions {
            if seen.contains(&&spec.name) {
                return Err(FlashwrightError::DuplicateName(spec.name.clone()));
            }
            seen.push(&spec.name);
        }

        for spec in &self.partitions[..self.partitions.len() - 1] {
            if spec.size == PartSize::Max {
                return Err(FlashwrightError::MisplacedMaxSize(spec.name.clone()));
            }
        }

        let count = self.partitions.len() as u32;
        for (key, target) in self.load.products() {
            let referenced = match target {
                ProductTarget::Device(index) => Some(*index),
                ProductTarget::Command { device_ref, .. } => *device_ref,
            };
            if let Some(index) = referenced
                && index >= count
            {
                return Err(FlashwrightError::Recipe(format!(
                    "product {} references partition {} but the table has only {} partition(s)",
                    key, index, count
                )));
            }
        }

        Ok(())
    }
}
