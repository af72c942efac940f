use crate::error::VersionError;
use crate::local::{LocalClientFactory, LocalNetwork};
use crate::protocol::ClientFactory;
use log::info;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use vigil_lib::SEPARATOR;

// (library tag, binding tag, auto-tested), newest first
const LOCAL_CATALOG: &[(&str, &str, bool)] = &[
    ("4.5.0", "1.6.6", true),
    ("4.2.6", "1.5.4", true),
    ("4.2.3", "1.5.4", true),
    ("4.1.0", "1.5.0", false),
    ("4.0.3", "1.4.0", false),
];

/// One selectable version of the protocol library.
pub struct VersionDescriptor {
    tag: String,
    binding_tag: String,
    auto_tested: bool,
    factory: Arc<dyn ClientFactory>,
}

impl VersionDescriptor {
    pub fn new(tag: impl Into<String>, binding_tag: impl Into<String>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            tag: tag.into(),
            binding_tag: binding_tag.into(),
            auto_tested: true,
            factory,
        }
    }

    /// Keeps the version selectable by tag but out of default runs.
    pub fn not_auto_tested(mut self) -> Self {
        self.auto_tested = false;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn binding_tag(&self) -> &str {
        &self.binding_tag
    }

    pub fn is_auto_tested(&self) -> bool {
        self.auto_tested
    }

    pub fn factory(&self) -> Arc<dyn ClientFactory> {
        Arc::clone(&self.factory)
    }

    fn answers_to(&self, tag: &str) -> bool {
        self.tag == tag || self.binding_tag == tag
    }
}

impl fmt::Debug for VersionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionDescriptor")
            .field("tag", &self.tag)
            .field("binding_tag", &self.binding_tag)
            .field("auto_tested", &self.auto_tested)
            .finish_non_exhaustive()
    }
}

/// Rejects any library or binding tag containing the name separator.
pub fn validate_tag_format(catalog: &[VersionDescriptor]) -> Result<(), VersionError> {
    for descriptor in catalog {
        if descriptor.tag.contains(SEPARATOR) {
            return Err(VersionError::InvalidTag {
                tag: descriptor.tag.clone(),
                field: "library tag",
            });
        }
        if descriptor.binding_tag.contains(SEPARATOR) {
            return Err(VersionError::InvalidTag {
                tag: descriptor.binding_tag.clone(),
                field: "binding tag",
            });
        }
    }
    Ok(())
}

/// Immutable catalog of protocol versions.
#[derive(Debug)]
pub struct VersionRegistry {
    catalog: Vec<Arc<VersionDescriptor>>,
    latest: Arc<VersionDescriptor>,
    forced: Option<Arc<VersionDescriptor>>,
}

impl VersionRegistry {
    pub fn new(catalog: Vec<VersionDescriptor>) -> Result<Self, VersionError> {
        validate_tag_format(&catalog)?;

        let mut seen = HashSet::new();
        for descriptor in &catalog {
            if !seen.insert(descriptor.tag.as_str()) {
                return Err(VersionError::Duplicate {
                    tag: descriptor.tag.clone(),
                });
            }
        }
        let catalog: Vec<Arc<VersionDescriptor>> = catalog.into_iter().map(Arc::new).collect();
        let latest = catalog
            .iter()
            .find(|d| d.auto_tested)
            .cloned()
            .ok_or(VersionError::EmptyCatalog)?;

        Ok(Self {
            catalog,
            latest,
            forced: None,
        })
    }

    /// Catalog backed by the in-process network, one factory per version.
    pub fn local(network: &LocalNetwork) -> Result<Self, VersionError> {
        let catalog = LOCAL_CATALOG
            .iter()
            .map(|(tag, binding, auto_tested)| {
                let factory = Arc::new(LocalClientFactory::new(network.clone(), *tag));
                let descriptor = VersionDescriptor::new(*tag, *binding, factory);
                if *auto_tested {
                    descriptor
                } else {
                    descriptor.not_auto_tested()
                }
            })
            .collect();
        Self::new(catalog)
    }

    /// Pins every default resolution to `tag`, matched against library or
    /// binding tags across the whole catalog.
    pub fn with_forced_version(mut self, tag: Option<&str>) -> Result<Self, VersionError> {
        self.forced = match tag {
            Some(tag) => {
                let descriptor = self.find(tag)?;
                info!("Forcing protocol version {} (bindings {})", descriptor.tag, descriptor.binding_tag);
                Some(descriptor)
            }
            None => None,
        };
        Ok(self)
    }

    /// Explicit tags win; otherwise the forced version, otherwise the newest
    /// auto-tested entry.
    pub fn resolve(&self, tag: Option<&str>) -> Result<Arc<VersionDescriptor>, VersionError> {
        match tag {
            Some(tag) => self.find(tag),
            None => Ok(self.default_version()),
        }
    }

    pub fn default_version(&self) -> Arc<VersionDescriptor> {
        Arc::clone(self.forced.as_ref().unwrap_or(&self.latest))
    }

    pub fn forced_version(&self) -> Option<&Arc<VersionDescriptor>> {
        self.forced.as_ref()
    }

    pub fn list_auto_tested(&self) -> Vec<Arc<VersionDescriptor>> {
        self.catalog.iter().filter(|d| d.auto_tested).cloned().collect()
    }

    pub fn list_all(&self) -> &[Arc<VersionDescriptor>] {
        &self.catalog
    }

    /// True when `tag` names a library or binding tag in the catalog.
    pub fn contains(&self, tag: &str) -> bool {
        self.catalog.iter().any(|d| d.answers_to(tag))
    }

    fn find(&self, tag: &str) -> Result<Arc<VersionDescriptor>, VersionError> {
        self.catalog
            .iter()
            .find(|d| d.tag == tag)
            .or_else(|| self.catalog.iter().find(|d| d.answers_to(tag)))
            .map(Arc::clone)
            .ok_or_else(|| VersionError::NotFound { tag: tag.to_string() })
    }
}
