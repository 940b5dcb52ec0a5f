//! Type catalog: the lookup tables the resolver works from
//!
//! The catalog maps step names to constructors, data kinds to the steps
//! producing them, and data kinds to their representations. It is built
//! once at startup from an explicit list of [`Plugin`]s and then only read.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::data::{Data, Kind};
use crate::representation::{Representation, RepresentationRegistration};
use crate::step::{Step, StepRegistration};

/// Errors raised while loading a plugin
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The plugin cannot be used in this environment
    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    /// The plugin registered something inconsistent
    #[error("invalid registration {name}: {reason}")]
    InvalidRegistration { name: String, reason: String },
}

/// A named group of registrations loaded together
///
/// A plugin whose `load` fails is skipped as a whole; the rest of the
/// catalog stays usable.
#[derive(Clone, Copy)]
pub struct Plugin {
    /// Plugin name used in logs
    pub name: &'static str,

    /// Register the plugin's steps, data kinds and representations
    pub load: fn(&mut TypeCatalog) -> Result<(), CatalogError>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name).finish()
    }
}

/// Registry of step types, data kinds and representations
#[derive(Default, Clone)]
pub struct TypeCatalog {
    steps: BTreeMap<&'static str, StepRegistration>,
    data_kinds: BTreeMap<Kind, &'static str>,
    representations: BTreeMap<Kind, RepresentationRegistration>,
}

impl TypeCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from plugins, skipping any that fail to load
    pub fn from_plugins(plugins: &[Plugin]) -> Self {
        let mut catalog = Self::new();
        for plugin in plugins {
            let mut scratch = Self::new();
            match (plugin.load)(&mut scratch) {
                Ok(()) => {
                    debug!(
                        plugin = plugin.name,
                        steps = scratch.steps.len(),
                        representations = scratch.representations.len(),
                        "Loaded plugin"
                    );
                    catalog.merge(scratch);
                }
                Err(e) => {
                    warn!(plugin = plugin.name, error = %e, "Skipping plugin that failed to load");
                }
            }
        }
        catalog
    }

    /// Register a step type
    ///
    /// The first registration of a name wins; later ones are ignored with
    /// a warning.
    pub fn register_step<S: Step>(&mut self) {
        self.insert_step(StepRegistration::of::<S>());
    }

    /// Register a data kind
    pub fn register_data<T: Data>(&mut self) {
        self.insert_data(T::KIND, std::any::type_name::<T>());
    }

    /// Register a representation
    pub fn register_representation<R: Representation>(&mut self) {
        self.insert_representation(RepresentationRegistration::of::<R>());
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&StepRegistration> {
        self.steps.get(name)
    }

    /// All registered steps, ordered by name
    pub fn steps(&self) -> impl Iterator<Item = &StepRegistration> {
        self.steps.values()
    }

    /// All registered data kinds with the Rust type behind each
    pub fn data_kinds(&self) -> impl Iterator<Item = (&Kind, &'static str)> {
        self.data_kinds.iter().map(|(kind, ty)| (kind, *ty))
    }

    /// Steps that can satisfy a requirement for `kind`
    ///
    /// A step producing a data kind also satisfies every representation
    /// of that kind. Results are ordered by step name.
    pub fn producers_of(&self, kind: &Kind) -> Vec<&StepRegistration> {
        let data_kind = self.representations.get(kind).map(|r| &r.data_kind);
        self.steps
            .values()
            .filter(|registration| {
                registration
                    .spec
                    .produces
                    .iter()
                    .any(|produced| produced == kind || Some(produced) == data_kind)
            })
            .collect()
    }

    /// Representations bound to a data kind
    pub fn representations_of(&self, data_kind: &Kind) -> Vec<&RepresentationRegistration> {
        self.representations
            .values()
            .filter(|r| &r.data_kind == data_kind)
            .collect()
    }

    /// Look up a representation by its own kind
    pub fn representation(&self, kind: &Kind) -> Option<&RepresentationRegistration> {
        self.representations.get(kind)
    }

    /// Number of registered steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if no step is registered
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn merge(&mut self, other: TypeCatalog) {
        for registration in other.steps.into_values() {
            self.insert_step(registration);
        }
        for (kind, ty) in other.data_kinds {
            self.insert_data(kind, ty);
        }
        for registration in other.representations.into_values() {
            self.insert_representation(registration);
        }
    }

    fn insert_step(&mut self, registration: StepRegistration) {
        let name = registration.name();
        if self.steps.contains_key(name) {
            warn!(step = name, "Step already registered, keeping the first registration");
            return;
        }
        self.steps.insert(name, registration);
    }

    fn insert_data(&mut self, kind: Kind, ty: &'static str) {
        if let Some(existing) = self.data_kinds.get(&kind) {
            if *existing != ty {
                warn!(%kind, existing, ignored = ty, "Data kind already registered, keeping the first registration");
            }
            return;
        }
        self.data_kinds.insert(kind, ty);
    }

    fn insert_representation(&mut self, registration: RepresentationRegistration) {
        if self.representations.contains_key(&registration.kind) {
            warn!(
                kind = %registration.kind,
                "Representation already registered, keeping the first registration"
            );
            return;
        }
        self.representations
            .insert(registration.kind.clone(), registration);
    }
}

impl fmt::Debug for TypeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCatalog")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("data_kinds", &self.data_kinds.keys().collect::<Vec<_>>())
            .field(
                "representations",
                &self.representations.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::representation::RenderError;
    use crate::step::{StepContext, StepError, StepSpec};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize)]
    struct Inventory(u32);

    impl Data for Inventory {
        const KIND: Kind = Kind::new("inventory");

        fn id(&self) -> String {
            self.0.to_string()
        }
    }

    struct InventoryJson;

    impl Representation for InventoryJson {
        type Data = Inventory;
        const KIND: Kind = Kind::new("inventory.json");
        const MIME: &'static str = "application/json";

        fn render(data: &Inventory) -> Result<String, RenderError> {
            Ok(serde_json::to_string(data)?)
        }
    }

    #[derive(Debug, Deserialize)]
    struct NoParams {}

    macro_rules! producer {
        ($ty:ident, $name:literal, $description:literal) => {
            struct $ty;

            #[async_trait]
            impl Step for $ty {
                const NAME: &'static str = $name;
                type Params = NoParams;

                fn spec() -> StepSpec {
                    StepSpec::new(Self::NAME)
                        .with_description($description)
                        .produces(Inventory::KIND)
                }

                fn new(_params: NoParams) -> Result<Self, StepError> {
                    Ok(Self)
                }

                async fn run(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
                    Ok(())
                }
            }
        };
    }

    producer!(ScanNodes, "scan_nodes", "first");
    producer!(ScanNodesAgain, "scan_nodes", "second");
    producer!(ReadInventory, "read_inventory", "alternative");

    fn inventory_plugin(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
        catalog.register_step::<ScanNodes>();
        catalog.register_data::<Inventory>();
        catalog.register_representation::<InventoryJson>();
        Ok(())
    }

    fn broken_plugin(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
        catalog.register_step::<ReadInventory>();
        Err(CatalogError::Unavailable("scanner binary not installed".into()))
    }

    fn shadowing_plugin(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
        catalog.register_step::<ScanNodesAgain>();
        Ok(())
    }

    #[test]
    fn test_broken_plugin_is_skipped() {
        let catalog = TypeCatalog::from_plugins(&[
            Plugin {
                name: "broken",
                load: broken_plugin,
            },
            Plugin {
                name: "inventory",
                load: inventory_plugin,
            },
        ]);

        assert_eq!(catalog.len(), 1);
        assert!(catalog.step("scan_nodes").is_some());
        // Registrations made before the failure are discarded too
        assert!(catalog.step("read_inventory").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let catalog = TypeCatalog::from_plugins(&[
            Plugin {
                name: "inventory",
                load: inventory_plugin,
            },
            Plugin {
                name: "shadow",
                load: shadowing_plugin,
            },
        ]);

        let step = catalog.step("scan_nodes").unwrap();
        assert_eq!(step.spec.description, "first");
    }

    #[test]
    fn test_producers_of_includes_representation_kinds() {
        let mut catalog = TypeCatalog::new();
        inventory_plugin(&mut catalog).unwrap();

        let direct: Vec<_> = catalog
            .producers_of(&Inventory::KIND)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(direct, vec!["scan_nodes"]);

        let via_representation: Vec<_> = catalog
            .producers_of(&InventoryJson::KIND)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(via_representation, vec!["scan_nodes"]);

        assert!(catalog.producers_of(&Kind::new("unknown")).is_empty());
    }

    #[test]
    fn test_representations_of() {
        let mut catalog = TypeCatalog::new();
        inventory_plugin(&mut catalog).unwrap();

        let reps = catalog.representations_of(&Inventory::KIND);
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].kind, InventoryJson::KIND);
        assert_eq!(reps[0].mime, "application/json");
        assert!(catalog.representation(&InventoryJson::KIND).is_some());
        assert_eq!(catalog.data_kinds().count(), 1);
    }

    #[test]
    fn test_multiple_producers_are_all_listed() {
        let mut catalog = TypeCatalog::new();
        catalog.register_step::<ReadInventory>();
        catalog.register_step::<ScanNodes>();

        let names: Vec<_> = catalog
            .producers_of(&Inventory::KIND)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["scan_nodes", "read_inventory"]);
    }
}
