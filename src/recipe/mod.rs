//! Typed recipe model and YAML loading.
//!
//! A recipe file is a multi-document YAML stream: the first document declares
//! the platform and its products, each following document carries a `type`
//! tag and a `recipe` payload. Recipe kinds form a closed enum; adding a new
//! provisioning target means adding an enum arm, and the compiler points at
//! every match that needs updating.

pub mod mmc;

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::Deserialize;

use crate::error::FlashwrightError;

pub use mmc::{
    FsType, LoadSpec, MmcRecipe, PartSize, PartitionSpec, ProductCategory, ProductKey,
    ProductTarget, TableFormat,
};

/// First document of a recipe file: the platform-products declaration.
///
/// `products` maps each product category to the file types its builds
/// provide (e.g., `linux: [boot, root, config]`).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformDeclaration {
    /// Platform name the recipe applies to.
    pub platform: String,
    /// Product categories and their file types.
    pub products: BTreeMap<ProductCategory, Vec<String>>,
}

/// A typed recipe document.
///
/// The YAML `type` field selects the variant; the payload lives under the
/// `recipe` key.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Recipe {
    /// SD/MMC card provisioning recipe.
    Mmc {
        /// The partition table and load mapping.
        recipe: MmcRecipe,
    },
}

impl Recipe {
    /// Returns a short name for the recipe kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Recipe::Mmc { .. } => "mmc",
        }
    }
}

/// A fully loaded recipe file.
#[derive(Debug)]
pub struct RecipeFile {
    pub platform: PlatformDeclaration,
    pub recipes: Vec<Recipe>,
}

/// Loads and structurally validates a recipe file.
///
/// Host-dependent validation (formatting tools, backend flags) happens later
/// in the partition planner; everything checkable from the document alone is
/// checked here, before any hardware is touched.
pub fn load_recipe_file(path: &Utf8Path) -> Result<RecipeFile, FlashwrightError> {
    let content = fs::read_to_string(path)
        .map_err(|e| FlashwrightError::io(format!("failed to read recipe file: {}", path), e))?;
    parse_recipe_str(&content)
}

/// Parses a multi-document recipe stream.
pub fn parse_recipe_str(content: &str) -> Result<RecipeFile, FlashwrightError> {
    let mut documents = serde_yaml::Deserializer::from_str(content);

    let Some(first) = documents.next() else {
        return Err(FlashwrightError::Recipe(
            "recipe file is empty; expected a platform declaration document".to_string(),
        ));
    };
    let platform = PlatformDeclaration::deserialize(first)
        .map_err(|e| FlashwrightError::Recipe(format!("invalid platform declaration: {}", e)))?;

    let mut recipes = Vec::new();
    for document in documents {
        let recipe = Recipe::deserialize(document)
            .map_err(|e| FlashwrightError::Recipe(format!("invalid recipe document: {}", e)))?;
        match &recipe {
            Recipe::Mmc { recipe } => recipe.validate()?,
        }
        recipes.push(recipe);
    }

    if recipes.is_empty() {
        return Err(FlashwrightError::Recipe(
            "recipe file declares no recipe documents".to_string(),
        ));
    }

    Ok(RecipeFile { platform, recipes })
}
