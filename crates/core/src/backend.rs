//! Seam between the decoding loop and an exported multimodal program.
//!
//! A backend exposes named methods operating on fixed-shape tensors:
//!
//! * `token_embedding(token_ids[1, T]) -> embeddings[1, T, H]`
//! * `vision_encoder(pixel_values[1, 3, S, S]) -> patch_embeddings[1, P, H]`
//! * `text_decoder(embeddings[1, T, H], positions[T]) -> logits[1, T, V]`
//!
//! plus zero-argument metadata accessors such as `get_max_seq_len`. The KV
//! cache lives inside the backend and is addressed only through positions.

use std::{collections::BTreeMap, fmt};

use anyhow::{Result, anyhow};
use candle_core::Tensor;

use crate::error::{GenerateError, GenerateResult, Phase};

pub const TOKEN_EMBEDDING: &str = "token_embedding";
pub const VISION_ENCODER: &str = "vision_encoder";
pub const TEXT_DECODER: &str = "text_decoder";

pub trait InferenceBackend {
    /// Names of every callable method, metadata accessors included.
    fn method_names(&self) -> Vec<String>;

    fn has_method(&self, name: &str) -> bool {
        self.method_names().iter().any(|method| method == name)
    }

    /// Execute `name` with positional inputs. Metadata accessors take none.
    fn run_method(&mut self, name: &str, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn method_names(&self) -> Vec<String> {
        (**self).method_names()
    }

    fn has_method(&self, name: &str) -> bool {
        (**self).has_method(name)
    }

    fn run_method(&mut self, name: &str, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        (**self).run_method(name, inputs)
    }
}

/// Runs `method` and returns its first output, tagging failures with the
/// loop phase so callers can tell a prefill fault from a decode fault.
pub(crate) fn invoke<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    phase: Phase,
    method: &str,
    inputs: &[Tensor],
) -> GenerateResult<Tensor> {
    let outputs = backend
        .run_method(method, inputs)
        .map_err(|err| GenerateError::backend(phase, method, err))?;
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| GenerateError::backend(phase, method, anyhow!("method returned no outputs")))
}

type MethodFn = Box<dyn FnMut(&[Tensor]) -> Result<Vec<Tensor>> + Send>;

/// Backend assembled from closures keyed by method name.
///
/// Useful for wiring a runtime binding without a dedicated type, and for
/// scripting model behaviour in tests.
#[derive(Default)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: FnMut(&[Tensor]) -> Result<Vec<Tensor>> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(method));
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: FnMut(&[Tensor]) -> Result<Vec<Tensor>> + Send + 'static,
    {
        self.insert(name, method);
        self
    }

    /// Registers a zero-argument accessor that always yields `value`.
    pub fn with_constant(self, name: impl Into<String>, value: Tensor) -> Self {
        self.with_method(name, move |_| Ok(vec![value.clone()]))
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InferenceBackend for MethodTable {
    fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn run_method(&mut self, name: &str, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let method = self
            .methods
            .get_mut(name)
            .ok_or_else(|| anyhow!("method `{name}` is not exported by this program"))?;
        method(inputs)
    }
}
