//! Representations: read-only projections of a data kind into a wire format

use std::fmt;
use std::sync::Arc;

use crate::data::{Data, Item, Kind, Rendered};

/// Error rendering a representation
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Item handed to the renderer is not of the bound data kind
    #[error("representation {representation} cannot render item of kind {actual}")]
    KindMismatch { representation: Kind, actual: Kind },

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Renderer-specific failure
    #[error("{0}")]
    Other(String),
}

/// A stateless projection of one data kind into a wire format
///
/// Representations count as outputs of any step that produces their data
/// kind: a consumer requiring `R::KIND` is satisfied by a producer of
/// `R::Data`.
pub trait Representation: Send + Sync + 'static {
    /// Data type this representation is bound to
    type Data: Data;

    /// Kind of the rendered output
    const KIND: Kind;

    /// MIME-like content type identifier
    const MIME: &'static str;

    /// Render a data value
    fn render(data: &Self::Data) -> Result<String, RenderError>;
}

/// Type-erased renderer function
pub type RenderFn = Arc<dyn Fn(&Item) -> Result<Item, RenderError> + Send + Sync>;

/// Catalog entry for a registered representation
#[derive(Clone)]
pub struct RepresentationRegistration {
    /// Kind of the rendered output
    pub kind: Kind,

    /// Data kind this representation renders
    pub data_kind: Kind,

    /// MIME-like content type identifier
    pub mime: &'static str,

    render: RenderFn,
}

impl RepresentationRegistration {
    /// Build the registration for a typed representation
    pub fn of<R: Representation>() -> Self {
        let render: RenderFn = Arc::new(|item: &Item| {
            let data = item.downcast_ref::<R::Data>().ok_or_else(|| {
                RenderError::KindMismatch {
                    representation: R::KIND,
                    actual: item.kind().clone(),
                }
            })?;
            let body = R::render(data)?;
            Ok(Item::rendered(
                R::KIND,
                item.id(),
                Rendered {
                    mime: R::MIME.to_string(),
                    body,
                },
            ))
        });

        Self {
            kind: R::KIND,
            data_kind: <R::Data as Data>::KIND,
            mime: R::MIME,
            render,
        }
    }

    /// Render an item into a new item of this representation's kind
    pub fn render(&self, item: &Item) -> Result<Item, RenderError> {
        (self.render)(item)
    }
}

impl fmt::Debug for RepresentationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepresentationRegistration")
            .field("kind", &self.kind)
            .field("data_kind", &self.data_kind)
            .field("mime", &self.mime)
            .finish()
    }
}
