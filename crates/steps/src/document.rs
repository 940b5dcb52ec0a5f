//! Static documents taken straight from workflow parameters

use serde::Deserialize;
use serde_json::{Map, Value};

use clusterfacts_core::prelude::*;

use crate::data::Document;

#[derive(Debug, Deserialize)]
pub struct StaticDocumentParams {
    pub name: String,

    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Emits one [`Document`] built from its parameters
pub struct StaticDocument {
    document: Document,
}

#[async_trait]
impl Step for StaticDocument {
    const NAME: &'static str = "static_document";
    type Params = StaticDocumentParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Emit a document built from workflow parameters")
            .produces(Document::KIND)
            .with_param(ParamSpec::required("name", "Document name"))
            .with_param(ParamSpec::optional("fields", "Document fields"))
    }

    fn new(params: StaticDocumentParams) -> Result<Self, StepError> {
        Ok(Self {
            document: Document {
                name: params.name,
                fields: params.fields,
            },
        })
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        ctx.emit_data(self.document.clone())?;
        Ok(())
    }
}
