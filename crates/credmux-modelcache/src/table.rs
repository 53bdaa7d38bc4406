use std::collections::HashMap;

use credmux_common::ModelId;

/// A fully-populated snapshot of the model cache, swapped in atomically by
/// [`crate::cache::ModelCache`] on every refresh. Readers hold this for the
/// duration of one dispatch (spec.md §5 "Model cache table: pointer-swap").
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    /// qualified model id -> credential keys eligible to serve it.
    pub model_to_credentials: HashMap<String, Vec<String>>,
    /// provider tag -> models it currently advertises.
    pub provider_to_models: HashMap<String, Vec<ModelId>>,
}
