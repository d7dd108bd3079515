// THEORY:
// The registry binds each (category, algorithm) key to its descriptor and to the
// plain function that implements it. It is filled once at startup and only read
// afterwards, so it needs no locking and is shared behind an `Arc`. Lookups by
// string exist for the shells; everything inside the crate looks up by enum.

use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::library::{ImageLibrary, LibraryResult};
use crate::core_modules::operations;
use crate::core_modules::params::ParameterSet;
use crate::error::{DispatchError, DispatchResult};
use image::RgbImage;

/// An algorithm implementation. Receives fully merged parameters and must not keep
/// any state between calls.
pub type Operation = fn(&dyn ImageLibrary, &RgbImage, &ParameterSet) -> LibraryResult<RgbImage>;

#[derive(Debug, Clone)]
pub struct Entry {
    pub descriptor: AlgorithmDescriptor,
    pub operation: Operation,
}

/// Catalog of registered algorithms, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full catalog: every category's operations, in catalog order.
    pub fn standard() -> DispatchResult<Self> {
        let mut registry = Self::new();
        operations::register_all(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: AlgorithmDescriptor, operation: Operation) -> DispatchResult<()> {
        if descriptor.category != descriptor.algorithm.category() {
            return Err(DispatchError::InvalidParameter(format!(
                "{} belongs to {}, not {}",
                descriptor.name(),
                descriptor.algorithm.category().name(),
                descriptor.category.name()
            )));
        }
        if self.get(descriptor.algorithm).is_some() {
            return Err(DispatchError::DuplicateKey {
                category: descriptor.category.name().to_string(),
                name: descriptor.name().to_string(),
            });
        }
        self.entries.push(Entry { descriptor, operation });
        Ok(())
    }

    pub fn get(&self, algorithm: Algorithm) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.descriptor.algorithm == algorithm)
    }

    /// Resolves a shell-supplied (category, name) pair. An unknown category is
    /// reported the same way as an unknown name.
    pub fn lookup(&self, category: &str, name: &str) -> DispatchResult<&Entry> {
        let unknown = || DispatchError::UnknownAlgorithm { category: category.to_string(), name: name.to_string() };
        let category: Category = category.parse().map_err(|_| unknown())?;
        self.entries
            .iter()
            .find(|entry| entry.descriptor.category == category && entry.descriptor.name() == name)
            .ok_or_else(unknown)
    }

    /// Display names registered under `category`, in registration order.
    pub fn list_algorithms(&self, category: &str) -> DispatchResult<Vec<&'static str>> {
        let category: Category = category.parse()?;
        Ok(self.descriptors(category).map(AlgorithmDescriptor::name).collect())
    }

    pub fn descriptors(&self, category: Category) -> impl Iterator<Item = &AlgorithmDescriptor> {
        self.entries
            .iter()
            .map(|entry| &entry.descriptor)
            .filter(move |descriptor| descriptor.category == category)
    }

    pub fn categories(&self) -> [Category; 5] {
        Category::ALL
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
