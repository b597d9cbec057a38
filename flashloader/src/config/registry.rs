//! Internal target registry

use super::Target;
use flashloader_target::{ChipFamily, TargetDescriptionSource};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::io::Read;

static REGISTRY: Lazy<RwLock<Registry>> =
    Lazy::new(|| RwLock::new(Registry::from_builtin_families()));

/// Error type for all errors which occur when working
/// with the internal registry of targets.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum RegistryError {
    /// The requested chip '{0}' was not found in the list of known targets.
    ChipNotFound(String),
    /// Found multiple chips matching '{0}', unable to select a single chip. ({1})
    ChipNotUnique(String, String),
    /// An error occurred while parsing a YAML target description.
    Yaml(#[from] serde_yaml::Error),
    /// Invalid chip family definition ({0}): {1}
    InvalidChipFamilyDefinition(String, String),
}

#[cfg(feature = "builtin-targets")]
const BUILTIN_TARGETS: &[(&str, &str)] = &[
    ("HC32F448", include_str!("../../targets/HC32F448.yaml")),
    ("nRF91xx", include_str!("../../targets/nRF91xx.yaml")),
];

#[cfg(not(feature = "builtin-targets"))]
const BUILTIN_TARGETS: &[(&str, &str)] = &[];

/// A collection of chip families, which targets are created from.
#[derive(Debug, Default)]
pub struct Registry {
    /// All the available chips.
    families: Vec<ChipFamily>,
}

impl Registry {
    /// A registry holding the target descriptions compiled into the library.
    ///
    /// A built-in description which fails to load is logged and left out.
    pub fn from_builtin_families() -> Self {
        let mut families = Vec::with_capacity(BUILTIN_TARGETS.len());

        for (name, yaml) in BUILTIN_TARGETS {
            match parse_family(yaml) {
                Ok(mut family) => {
                    family.source = TargetDescriptionSource::BuiltIn;
                    families.push(family);
                }
                Err(error) => {
                    tracing::error!("Failed to load the built-in target description {name}: {error}");
                }
            }
        }

        Self { families }
    }

    /// All chip families in the registry.
    pub fn families(&self) -> &[ChipFamily] {
        &self.families
    }

    /// Creates the target for the chip called `name`.
    ///
    /// The name is compared ignoring case. If no chip has exactly this name, a chip
    /// whose name starts with it is used, as long as there is only one.
    pub fn get_target_by_name(&self, name: impl AsRef<str>) -> Result<Target, RegistryError> {
        let name = name.as_ref();

        tracing::debug!("Searching registry for chip with name {}", name);

        let lowercase = name.to_ascii_lowercase();
        let mut partial_matches = Vec::new();

        for family in &self.families {
            for variant in family.variants() {
                if variant.name.eq_ignore_ascii_case(name) {
                    return Ok(Target::new(family, variant));
                }
                if variant.name.to_ascii_lowercase().starts_with(&lowercase) {
                    partial_matches.push((family, variant));
                }
            }
        }

        match partial_matches.as_slice() {
            [] => Err(RegistryError::ChipNotFound(name.to_string())),
            [(family, variant)] => {
                tracing::warn!(
                    "Found chip {} which matches given partial name {}. Consider specifying its full name.",
                    variant.name,
                    name,
                );
                Ok(Target::new(family, variant))
            }
            candidates => {
                let names = candidates
                    .iter()
                    .map(|(_, variant)| variant.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(RegistryError::ChipNotUnique(name.to_string(), names))
            }
        }
    }

    /// Names of all chips whose name contains `pattern`, ignoring case.
    pub fn search_chips(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_ascii_lowercase();

        self.families
            .iter()
            .flat_map(|family| family.variants())
            .filter(|variant| variant.name.to_ascii_lowercase().contains(&pattern))
            .map(|variant| variant.name.clone())
            .collect()
    }

    /// Validates `family` and adds it, replacing a family of the same name.
    pub fn add_target_family(&mut self, family: ChipFamily) -> Result<String, RegistryError> {
        family
            .validate()
            .map_err(|error| RegistryError::InvalidChipFamilyDefinition(family.name.clone(), error))?;

        let family_name = family.name.clone();

        self.families
            .retain(|old_family| !old_family.name.eq_ignore_ascii_case(&family_name));
        self.families.push(family);

        Ok(family_name)
    }

    /// Parses a YAML target description and adds the family it describes.
    pub fn add_target_family_from_yaml(&mut self, yaml: &str) -> Result<String, RegistryError> {
        let family: ChipFamily = serde_yaml::from_str(yaml)?;
        self.add_target_family(family)
    }
}

fn parse_family(yaml: &str) -> Result<ChipFamily, RegistryError> {
    let family: ChipFamily = serde_yaml::from_str(yaml)?;
    family
        .validate()
        .map_err(|error| RegistryError::InvalidChipFamilyDefinition(family.name.clone(), error))?;

    Ok(family)
}

/// Get a target from the internal registry based on its name.
pub fn get_target_by_name(name: impl AsRef<str>) -> Result<Target, RegistryError> {
    REGISTRY.read().get_target_by_name(name)
}

/// Returns the names of all chips in the registry containing `pattern`.
pub fn search_chips(pattern: &str) -> Vec<String> {
    REGISTRY.read().search_chips(pattern)
}

/// Names of all chip families in the registry.
pub fn families() -> Vec<String> {
    REGISTRY
        .read()
        .families()
        .iter()
        .map(|family| family.name.clone())
        .collect()
}

/// Parse a target description and add the contained targets
/// to the internal target registry.
///
/// # Example
///
/// ```no_run
/// use flashloader::config::add_target_family_from_yaml;
///
/// let description = std::fs::read_to_string("custom_targets.yaml")?;
/// add_target_family_from_yaml(&description)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn add_target_family_from_yaml(yaml: &str) -> Result<String, RegistryError> {
    REGISTRY.write().add_target_family_from_yaml(yaml)
}

/// Parse a target description from `reader` and add the contained targets
/// to the internal target registry.
pub fn add_target_family_from_reader(reader: impl Read) -> Result<String, RegistryError> {
    let family: ChipFamily = serde_yaml::from_reader(reader)?;
    REGISTRY.write().add_target_family(family)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("HC32F448xC"; "exact")]
    #[test_case("hc32f448xc"; "ignoring case")]
    #[test_case("nRF9160"; "unique prefix")]
    fn builtin_targets_are_found(name: &str) {
        let registry = Registry::from_builtin_families();
        assert!(registry.get_target_by_name(name).is_ok());
    }

    #[test]
    fn ambiguous_prefix_is_rejected() {
        let registry = Registry::from_builtin_families();
        let error = registry.get_target_by_name("HC32F448").unwrap_err();

        assert!(
            matches!(&error, RegistryError::ChipNotUnique(_, names) if names == "HC32F448xA, HC32F448xC"),
            "{error}"
        );
    }

    #[test]
    fn unknown_chip() {
        let registry = Registry::from_builtin_families();
        assert!(matches!(
            registry.get_target_by_name("STM32F103"),
            Err(RegistryError::ChipNotFound(_))
        ));
    }

    #[test]
    fn builtin_families_are_marked() {
        let registry = Registry::from_builtin_families();

        assert_eq!(registry.families().len(), 2);
        assert!(registry
            .families()
            .iter()
            .all(|family| family.source == TargetDescriptionSource::BuiltIn));
    }

    #[test]
    fn invalid_family_is_rejected() {
        let mut registry = Registry::default();
        let yaml = r#"
name: Broken Series
variants:
- name: BROKEN1
  memory_map:
  - !Ram
    range:
      start: 0x20000000
      end: 0x20008000
  flash_algorithms:
  - missing_flash
"#;

        let error = registry.add_target_family_from_yaml(yaml).unwrap_err();
        assert!(matches!(error, RegistryError::InvalidChipFamilyDefinition(..)));
        assert!(registry.families().is_empty());
    }

    #[test]
    fn search() {
        let registry = Registry::from_builtin_families();
        assert_eq!(
            registry.search_chips("f448"),
            vec!["HC32F448xA".to_string(), "HC32F448xC".to_string()]
        );
    }

    #[test]
    fn family_is_added_from_reader() {
        let yaml = include_str!("../../targets/nRF91xx.yaml")
            .replace("nRF91 Series", "Reader Series")
            .replace("nRF9160_xxAA", "READER9160");

        let name = add_target_family_from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(name, "Reader Series");
        assert!(families().contains(&"Reader Series".to_string()));

        let target = get_target_by_name("READER9160").unwrap();
        assert_eq!(target.flash_algorithms.len(), 2);
        assert_eq!(target.source, TargetDescriptionSource::External);
    }
}
