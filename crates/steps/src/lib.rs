// Clusterfacts Built-in Steps
//
// Leaf producers and publishers, registered through an explicit manifest.
// A binary builds its catalog with `builtin_catalog()`, or passes its own
// plugin list (usually `PLUGINS` plus site plugins) to
// `TypeCatalog::from_plugins`.

pub mod data;
pub mod document;
pub mod logs;
pub mod publish;

use clusterfacts_core::{CatalogError, Plugin, TypeCatalog};

pub use data::{Document, DocumentJson, LogBatch, LogBatchJson, LogBatchText, LogLine};
pub use document::StaticDocument;
pub use logs::{TailLog, TailLogDir, DEFAULT_STATE_DIR};
pub use publish::{PublishBus, PublishFile, PublishHttp};

/// Plugins shipped with Clusterfacts
pub const PLUGINS: &[Plugin] = &[
    Plugin {
        name: "logs",
        load: load_logs,
    },
    Plugin {
        name: "documents",
        load: load_documents,
    },
    Plugin {
        name: "publishers",
        load: load_publishers,
    },
];

/// Catalog of every built-in step, data kind and representation
pub fn builtin_catalog() -> TypeCatalog {
    TypeCatalog::from_plugins(PLUGINS)
}

fn load_logs(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
    catalog.register_data::<LogBatch>();
    catalog.register_representation::<LogBatchText>();
    catalog.register_representation::<LogBatchJson>();
    catalog.register_step::<TailLog>();
    catalog.register_step::<TailLogDir>();
    Ok(())
}

fn load_documents(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
    catalog.register_data::<Document>();
    catalog.register_representation::<DocumentJson>();
    catalog.register_step::<StaticDocument>();
    Ok(())
}

fn load_publishers(catalog: &mut TypeCatalog) -> Result<(), CatalogError> {
    catalog.register_step::<PublishFile>();
    catalog.register_step::<PublishHttp>();
    catalog.register_step::<PublishBus>();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterfacts_core::{Data, Kind};

    #[test]
    fn test_builtin_catalog_contents() {
        let catalog = builtin_catalog();
        let names: Vec<&str> = catalog.steps().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "publish_bus",
                "publish_file",
                "publish_http",
                "static_document",
                "tail_log",
                "tail_log_dir"
            ]
        );
        assert_eq!(catalog.representations_of(&LogBatch::KIND).len(), 2);
    }

    #[test]
    fn test_representation_kinds_resolve_to_producers() {
        let catalog = builtin_catalog();
        let producers: Vec<&str> = catalog
            .producers_of(&Kind::new("document.json"))
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(producers, vec!["static_document"]);
        assert_eq!(catalog.producers_of(&Kind::new("log_batch.text")).len(), 2);
    }
}
